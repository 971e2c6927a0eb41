//! In-memory backend with fault injection.
//!
//! Behaves like a single-part S3 store: every put gets a fresh quoted MD5
//! ETag, user metadata is stored as given. Failures can be scripted per
//! operation and key, or for listing calls, to exercise the error paths of
//! the sync pipeline without a network.

use crate::models::{bucket::BucketDetails, object::ObjectDescriptor};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::storage::{
    ListPage, Storage, StorageError, StorageErrorKind, StorageFactory, StorageResult,
};

/// Operation a scripted fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Head,
    Get,
    Put,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    kind: StorageErrorKind,
    /// Calls let through before the fault arms.
    skip: usize,
    /// `None` fails forever.
    remaining: Option<usize>,
}

impl Fault {
    /// Consume one firing. Returns the kind if the fault is still armed.
    fn fire(&mut self) -> Option<StorageErrorKind> {
        if self.skip > 0 {
            self.skip -= 1;
            return None;
        }
        match &mut self.remaining {
            None => Some(self.kind),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(self.kind)
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    exists: bool,
    objects: BTreeMap<String, ObjectDescriptor>,
    faults: HashMap<(Operation, String), Fault>,
    list_fault: Option<Fault>,
    list_calls: usize,
    head_calls: usize,
    uploaded: Vec<String>,
}

pub struct MemoryStorage {
    bucket: String,
    latency: Option<Duration>,
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    /// An existing, empty bucket.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            latency: None,
            state: Mutex::new(MemoryState {
                exists: true,
                ..MemoryState::default()
            }),
        }
    }

    /// A bucket that has not been created yet.
    pub fn missing(bucket: impl Into<String>) -> Self {
        let storage = Self::new(bucket);
        storage.lock().exists = false;
        storage
    }

    /// Delay every get and put by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object exactly as given. A missing ETag is computed from the payload.
    pub fn insert(&self, mut object: ObjectDescriptor) {
        if object.etag.is_none() {
            object.etag = object.payload.as_deref().map(quoted_md5);
        }
        if object.size.is_none() {
            object.size = object.payload.as_ref().map(|p| p.len() as i64);
        }
        self.lock().objects.insert(object.key.clone(), object);
    }

    pub fn object(&self, key: &str) -> Option<ObjectDescriptor> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Fail every `operation` on `key` with `kind`.
    pub fn fail(&self, operation: Operation, key: &str, kind: StorageErrorKind) {
        self.script(operation, key, kind, None);
    }

    /// Fail the next `times` calls of `operation` on `key`, then recover.
    pub fn fail_times(&self, operation: Operation, key: &str, kind: StorageErrorKind, times: usize) {
        self.script(operation, key, kind, Some(times));
    }

    fn script(&self, operation: Operation, key: &str, kind: StorageErrorKind, remaining: Option<usize>) {
        self.lock()
            .faults
            .insert((operation, key.to_string()), Fault {
                kind,
                skip: 0,
                remaining,
            });
    }

    /// Fail listing calls with `kind`; `times` of `None` fails forever.
    pub fn fail_list(&self, kind: StorageErrorKind, times: Option<usize>) {
        self.lock().list_fault = Some(Fault {
            kind,
            skip: 0,
            remaining: times,
        });
    }

    /// Let the first `pages` listing calls succeed, then fail every later
    /// one with `kind`.
    pub fn fail_list_after(&self, pages: usize, kind: StorageErrorKind) {
        self.lock().list_fault = Some(Fault {
            kind,
            skip: pages,
            remaining: None,
        });
    }

    /// Number of successful puts.
    pub fn put_count(&self) -> usize {
        self.lock().uploaded.len()
    }

    /// Keys of successful puts, in completion order.
    pub fn uploaded_keys(&self) -> Vec<String> {
        self.lock().uploaded.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn head_calls(&self) -> usize {
        self.lock().head_calls
    }

    fn check_fault(&self, operation: Operation, key: &str) -> StorageResult<()> {
        let mut state = self.lock();
        if !state.exists {
            return Err(StorageError::BucketNotFound(self.bucket.clone()));
        }
        let fired = state
            .faults
            .get_mut(&(operation, key.to_string()))
            .and_then(Fault::fire);
        match fired {
            Some(kind) => Err(self.injected(kind, key)),
            None => Ok(()),
        }
    }

    fn injected(&self, kind: StorageErrorKind, key: &str) -> StorageError {
        match kind {
            StorageErrorKind::NotFound => StorageError::ObjectNotFound {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            },
            StorageErrorKind::PermissionDenied => {
                StorageError::PermissionDenied(format!("injected on `{key}`"))
            }
            StorageErrorKind::InvalidConfiguration => {
                StorageError::InvalidConfiguration(format!("injected on `{}`", self.bucket))
            }
            StorageErrorKind::Transient => StorageError::Transient(format!("injected on `{key}`")),
            StorageErrorKind::Other => StorageError::Backend(format!("injected on `{key}`")),
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn lookup(&self, key: &str) -> StorageResult<ObjectDescriptor> {
        self.lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            })
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn describe(&self) -> String {
        format!("memory://{}", self.bucket)
    }

    async fn list_page(
        &self,
        continuation_token: Option<String>,
        max_keys: usize,
    ) -> StorageResult<ListPage> {
        let mut state = self.lock();
        state.list_calls += 1;
        if !state.exists {
            return Err(StorageError::BucketNotFound(self.bucket.clone()));
        }
        if let Some(kind) = state.list_fault.as_mut().and_then(Fault::fire) {
            return Err(self.injected(kind, ""));
        }

        let lower = match continuation_token {
            Some(token) => Bound::Excluded(token),
            None => Bound::Unbounded,
        };
        let max_keys = max_keys.max(1);
        let mut objects: Vec<ObjectDescriptor> = state
            .objects
            .range((lower, Bound::Unbounded))
            .take(max_keys + 1)
            .map(|(_, object)| ObjectDescriptor {
                payload: None,
                metadata: Default::default(),
                ..object.clone()
            })
            .collect();

        let mut next_continuation_token = None;
        if objects.len() > max_keys {
            objects.pop();
            next_continuation_token = objects.last().map(|o| o.key.clone());
        }

        Ok(ListPage {
            objects,
            next_continuation_token,
        })
    }

    async fn head_object(
        &self,
        key: &str,
        _version_id: Option<&str>,
    ) -> StorageResult<ObjectDescriptor> {
        self.lock().head_calls += 1;
        self.check_fault(Operation::Head, key)?;
        let mut object = self.lookup(key)?;
        object.payload = None;
        Ok(object)
    }

    async fn get_object(
        &self,
        key: &str,
        _version_id: Option<&str>,
    ) -> StorageResult<ObjectDescriptor> {
        self.simulate_latency().await;
        self.check_fault(Operation::Get, key)?;
        self.lookup(key)
    }

    async fn put_object(&self, object: &ObjectDescriptor) -> StorageResult<()> {
        self.simulate_latency().await;
        self.check_fault(Operation::Put, &object.key)?;
        let payload = object
            .payload
            .clone()
            .ok_or_else(|| StorageError::MissingPayload(object.key.clone()))?;

        let stored = ObjectDescriptor {
            key: object.key.clone(),
            version_id: None,
            etag: Some(quoted_md5(&payload)),
            size: Some(payload.len() as i64),
            content_type: object.content_type.clone(),
            last_modified: Some(chrono::Utc::now()),
            metadata: object.metadata.clone(),
            payload: Some(payload),
        };

        let mut state = self.lock();
        state.objects.insert(stored.key.clone(), stored);
        state.uploaded.push(object.key.clone());
        Ok(())
    }

    async fn bucket_exists(&self) -> StorageResult<bool> {
        Ok(self.lock().exists)
    }

    async fn create_bucket(&self) -> StorageResult<()> {
        self.lock().exists = true;
        Ok(())
    }
}

fn quoted_md5(payload: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(payload))
}

/// Hands out `MemoryStorage` buckets by name. Unknown names open as missing
/// buckets, so provisioning can be observed.
#[derive(Default)]
pub struct MemoryStorageFactory {
    buckets: Mutex<HashMap<String, Arc<MemoryStorage>>>,
}

impl MemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, storage: Arc<MemoryStorage>) {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(storage.bucket.clone(), storage);
    }

    pub fn bucket(&self, name: &str) -> Option<Arc<MemoryStorage>> {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl StorageFactory for MemoryStorageFactory {
    async fn open(&self, details: &BucketDetails) -> StorageResult<Arc<dyn Storage>> {
        let storage = self
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(details.bucket_name.clone())
            .or_insert_with(|| Arc::new(MemoryStorage::missing(details.bucket_name.clone())))
            .clone();
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_fault_recovers_after_count() {
        let storage = MemoryStorage::new("uploads");
        storage.insert(ObjectDescriptor::new("a").with_payload(&b"1"[..]));
        storage.fail_times(Operation::Get, "a", StorageErrorKind::Transient, 1);

        let err = storage.get_object("a", None).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Transient);
        assert!(storage.get_object("a", None).await.is_ok());
    }

    #[tokio::test]
    async fn put_redigests_and_keeps_metadata() {
        let storage = MemoryStorage::new("uploads");
        let mut object = ObjectDescriptor::new("k")
            .with_etag("\"multi-3\"")
            .with_payload(&b"payload"[..]);
        object.metadata.set_original_etag("\"multi-3\"");

        storage.put_object(&object).await.unwrap();
        let stored = storage.object("k").unwrap();
        assert_eq!(stored.etag, Some(quoted_md5(b"payload")));
        assert_eq!(stored.metadata.original_etag(), Some("\"multi-3\""));
        assert_eq!(storage.uploaded_keys(), ["k"]);
    }

    #[tokio::test]
    async fn list_pages_without_payloads() {
        let storage = MemoryStorage::new("uploads");
        for key in ["a", "b", "c"] {
            storage.insert(ObjectDescriptor::new(key).with_payload(key.as_bytes().to_vec()));
        }

        let page = storage.list_page(None, 2).await.unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(page.objects.iter().all(|o| o.payload.is_none()));

        let rest = storage.list_page(page.next_continuation_token, 2).await.unwrap();
        assert_eq!(rest.objects[0].key, "c");
        assert!(rest.next_continuation_token.is_none());
        assert_eq!(storage.list_calls(), 2);
    }

    #[tokio::test]
    async fn missing_bucket_fails_with_configuration_kind() {
        let storage = MemoryStorage::missing("later");
        let err = storage.list_page(None, 10).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidConfiguration);

        storage.create_bucket().await.unwrap();
        assert!(storage.bucket_exists().await.unwrap());
    }
}
