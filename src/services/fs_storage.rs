//! src/services/fs_storage.rs
//!
//! Filesystem backend: SQLite catalog for bucket/object/metadata rows and
//! on-disk payloads sharded beneath `root/objects/{bucket}/{shard}/{shard}/{key}`.
//!
//! The backend computes its own MD5 ETag for every write, the way a plain
//! single-part S3 PUT does. Objects that arrive from a multipart source
//! therefore get a different raw ETag here than at the source, which is
//! exactly the case the `x-original-etag` annotation exists for.
//!
//! The store is unversioned: version ids are accepted and ignored.

use crate::models::{
    bucket::BucketRecord,
    metadata::Metadata,
    object::{ObjectDescriptor, ObjectRecord},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::BytesMut;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use super::storage::{ListPage, Storage, StorageError, StorageResult};

const CATALOG_FILE: &str = "catalog.db";
const OBJECTS_DIR: &str = "objects";
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");
const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const MAX_LIST_KEYS: usize = 1000;
const WRITE_CHUNK_SIZE: usize = 64 * 1024;
const LOCAL_REGION: &str = "local";

/// Bucket-bound handle onto a filesystem object store.
#[derive(Clone)]
pub struct FsStorage {
    /// Shared SQLite connection pool used for catalog operations.
    db: Arc<SqlitePool>,

    /// Root directory holding the catalog and the payload tree.
    base_path: PathBuf,

    bucket: String,
}

impl FsStorage {
    /// Open (creating if needed) the store rooted at `root` and bind it to
    /// `bucket`. The bucket itself is not created.
    pub async fn open(root: impl Into<PathBuf>, bucket: &str) -> StorageResult<Self> {
        let base_path = root.into();
        fs::create_dir_all(&base_path).await?;

        let options = SqliteConnectOptions::new()
            .filename(base_path.join(CATALOG_FILE))
            .create_if_missing(true)
            .foreign_keys(true);
        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        migrate(&db).await?;

        let storage = Self::new(Arc::new(db), base_path, bucket);
        storage.ensure_bucket_name_safe(bucket)?;
        Ok(storage)
    }

    /// Wrap an already migrated pool.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, bucket: &str) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            bucket: bucket.to_string(),
        }
    }

    /// Reject keys that could escape the bucket directory.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        let unsafe_key = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.split('/').any(|segment| segment == "..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if unsafe_key {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// S3-like bucket naming rules, which keep the directory layout predictable.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let reason = if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&name.len()) {
            Some("must be between 3 and 63 characters")
        } else if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            Some("allowed characters are lowercase letters, digits, dots, and hyphens")
        } else if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            Some("must start and end with a lowercase letter or digit")
        } else if name.contains("..") || name.contains("-.") || name.contains(".-") {
            Some("cannot contain consecutive dots or dot-hyphen combinations")
        } else if is_ipv4_like(name) {
            Some("must not be formatted like an IP address")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: reason.into(),
            }),
            None => Ok(()),
        }
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(OBJECTS_DIR).join(&self.bucket)
    }

    /// Two-level shard directories from MD5(bucket/key), 00–ff each.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(&self.bucket, key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_bucket(&self) -> StorageResult<BucketRecord> {
        sqlx::query_as::<Sqlite, BucketRecord>(
            "SELECT id, name, region, created_at FROM buckets WHERE name = ?",
        )
        .bind(&self.bucket)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::BucketNotFound(self.bucket.clone()))
    }

    async fn fetch_object(&self, bucket: &BucketRecord, key: &str) -> StorageResult<ObjectDescriptor> {
        let record = sqlx::query_as::<Sqlite, ObjectRecord>(
            "SELECT id, bucket_id, key, content_type, size_bytes, etag, last_modified, version_id
             FROM objects
             WHERE key = ? AND bucket_id = ?",
        )
        .bind(key)
        .bind(bucket.id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::ObjectNotFound {
            bucket: bucket.name.clone(),
            key: key.to_string(),
        })?;

        let entries = sqlx::query_as::<Sqlite, (String, String)>(
            "SELECT key, value FROM object_metadata WHERE object_id = ?",
        )
        .bind(record.id)
        .fetch_all(&*self.db)
        .await?;

        Ok(record.into_descriptor(entries.into_iter().collect::<Metadata>()))
    }

    /// Write the payload to a temp file, fsync, then rename into place.
    /// Returns the MD5 ETag and the size.
    async fn write_payload(&self, key: &str, payload: &[u8]) -> StorageResult<(String, i64)> {
        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let mut digest = Context::new();
        let written: io::Result<()> = async {
            let mut file = File::create(&tmp_path).await?;
            for chunk in payload.chunks(WRITE_CHUNK_SIZE) {
                digest.consume(chunk);
                file.write_all(chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        Ok((format!("{:x}", digest.compute()), payload.len() as i64))
    }

    /// Upsert the object row and replace its metadata in one transaction.
    async fn record_object(
        &self,
        bucket: &BucketRecord,
        object: &ObjectDescriptor,
        etag: &str,
        size_bytes: i64,
    ) -> StorageResult<()> {
        let mut tx = self.db.begin().await?;

        let object_id = sqlx::query_scalar::<Sqlite, Uuid>(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, content_type, size_bytes, etag, last_modified, version_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                version_id = excluded.version_id
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bucket.id)
        .bind(&object.key)
        .bind(object.content_type.clone())
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .bind::<Option<String>>(None)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;

        for (key, value) in object.metadata.iter() {
            sqlx::query("INSERT INTO object_metadata (object_id, key, value) VALUES (?, ?, ?)")
                .bind(object_id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FsStorage {
    fn describe(&self) -> String {
        format!("file://{}/{}", self.base_path.display(), self.bucket)
    }

    /// Key-ordered listing with `key > token` continuation, ListObjectsV2 style.
    async fn list_page(
        &self,
        continuation_token: Option<String>,
        max_keys: usize,
    ) -> StorageResult<ListPage> {
        let bucket = self.fetch_bucket().await?;
        let max_keys = max_keys.clamp(1, MAX_LIST_KEYS);
        let fetch_limit = max_keys + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, bucket_id, key, content_type, size_bytes, etag, last_modified, version_id \
             FROM objects WHERE bucket_id = ",
        );
        builder.push_bind(bucket.id);

        if let Some(token) = continuation_token.as_deref() {
            builder.push(" AND key > ");
            builder.push_bind(decode_continuation_token(token));
        }

        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<ObjectRecord> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut next_continuation_token = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_continuation_token = rows.last().map(|row| encode_continuation_token(&row.key));
        }

        Ok(ListPage {
            objects: rows
                .into_iter()
                .map(|row| row.into_descriptor(Metadata::new()))
                .collect(),
            next_continuation_token,
        })
    }

    async fn head_object(
        &self,
        key: &str,
        _version_id: Option<&str>,
    ) -> StorageResult<ObjectDescriptor> {
        self.ensure_key_safe(key)?;
        let bucket = self.fetch_bucket().await?;
        self.fetch_object(&bucket, key).await
    }

    async fn get_object(
        &self,
        key: &str,
        _version_id: Option<&str>,
    ) -> StorageResult<ObjectDescriptor> {
        self.ensure_key_safe(key)?;
        let bucket = self.fetch_bucket().await?;
        let mut object = self.fetch_object(&bucket, key).await?;

        // Catalog row without a payload file reads as a missing object.
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.name.clone(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        let mut payload = BytesMut::with_capacity(object.size.unwrap_or(0).max(0) as usize);
        let mut stream = ReaderStream::new(file);
        while let Some(chunk) = stream.next().await {
            payload.extend_from_slice(&chunk?);
        }
        object.payload = Some(payload.freeze());
        Ok(object)
    }

    async fn put_object(&self, object: &ObjectDescriptor) -> StorageResult<()> {
        self.ensure_key_safe(&object.key)?;
        let payload = object
            .payload
            .as_ref()
            .ok_or_else(|| StorageError::MissingPayload(object.key.clone()))?;
        let bucket = self.fetch_bucket().await?;

        let (etag, size_bytes) = self.write_payload(&object.key, payload).await?;
        // On catalog failure the payload file stays; the next write replaces it.
        self.record_object(&bucket, object, &etag, size_bytes).await?;

        debug!(bucket = %self.bucket, key = %object.key, etag = %etag, "stored object");
        Ok(())
    }

    async fn bucket_exists(&self) -> StorageResult<bool> {
        match self.fetch_bucket().await {
            Ok(_) => Ok(true),
            Err(StorageError::BucketNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Insert the bucket row and create its directory. Idempotent.
    async fn create_bucket(&self) -> StorageResult<()> {
        fs::create_dir_all(self.bucket_root()).await?;

        sqlx::query(
            "INSERT INTO buckets (id, name, region, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(&self.bucket)
        .bind(LOCAL_REGION)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        Ok(())
    }
}

/// Apply the embedded schema, one statement at a time.
pub async fn migrate(db: &SqlitePool) -> StorageResult<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty());

    for stmt in statements {
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

fn encode_continuation_token(key: &str) -> String {
    general_purpose::STANDARD.encode(key)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

/// Check if a string matches IPv4-like dotted decimal form, e.g. `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::StorageErrorKind;
    use tempfile::TempDir;

    async fn open_bucket(dir: &TempDir, bucket: &str) -> FsStorage {
        let storage = FsStorage::open(dir.path(), bucket).await.unwrap();
        storage.create_bucket().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn put_then_get_round_trips_payload_and_metadata() {
        let dir = TempDir::new().unwrap();
        let storage = open_bucket(&dir, "backup-team-a-uploads").await;

        let mut metadata = Metadata::new();
        metadata.insert("X-Original-ETag", "\"abc-2\"");
        let object = ObjectDescriptor::new("photos/2025/img.jpg")
            .with_etag("\"abc-2\"")
            .with_metadata(metadata)
            .with_payload(&b"hello world"[..]);

        storage.put_object(&object).await.unwrap();
        let loaded = storage.get_object("photos/2025/img.jpg", None).await.unwrap();

        assert_eq!(loaded.payload.as_deref(), Some(&b"hello world"[..]));
        assert_eq!(loaded.metadata.original_etag(), Some("\"abc-2\""));
        assert_eq!(loaded.size, Some(11));
        // The backend re-digests: plain MD5 of the payload.
        assert_eq!(
            loaded.etag.as_deref(),
            Some(format!("{:x}", md5::compute(b"hello world")).as_str())
        );
    }

    #[tokio::test]
    async fn overwrite_replaces_metadata() {
        let dir = TempDir::new().unwrap();
        let storage = open_bucket(&dir, "backup-bucket").await;

        let mut first = Metadata::new();
        first.insert("stale", "yes");
        storage
            .put_object(&ObjectDescriptor::new("k").with_metadata(first).with_payload(&b"1"[..]))
            .await
            .unwrap();
        storage
            .put_object(&ObjectDescriptor::new("k").with_payload(&b"22"[..]))
            .await
            .unwrap();

        let head = storage.head_object("k", None).await.unwrap();
        assert!(head.metadata.get("stale").is_none());
        assert_eq!(head.size, Some(2));
    }

    #[tokio::test]
    async fn list_pages_in_key_order() {
        let dir = TempDir::new().unwrap();
        let storage = open_bucket(&dir, "backup-bucket").await;
        for key in ["c", "a", "e", "b", "d"] {
            storage
                .put_object(&ObjectDescriptor::new(key).with_payload(key.as_bytes().to_vec()))
                .await
                .unwrap();
        }

        let first = storage.list_page(None, 2).await.unwrap();
        let keys: Vec<_> = first.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["a", "b"]);

        let second = storage
            .list_page(first.next_continuation_token, 2)
            .await
            .unwrap();
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["c", "d"]);

        let last = storage
            .list_page(second.next_continuation_token, 2)
            .await
            .unwrap();
        let keys: Vec<_> = last.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["e"]);
        assert!(last.next_continuation_token.is_none());
    }

    #[tokio::test]
    async fn missing_object_and_bucket_kinds() {
        let dir = TempDir::new().unwrap();
        let storage = FsStorage::open(dir.path(), "not-created").await.unwrap();

        assert!(!storage.bucket_exists().await.unwrap());
        let err = storage.list_page(None, 10).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidConfiguration);

        storage.create_bucket().await.unwrap();
        storage.create_bucket().await.unwrap();
        assert!(storage.bucket_exists().await.unwrap());

        let err = storage.head_object("nope", None).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);
    }

    #[tokio::test]
    async fn rejects_traversal_keys_and_bad_bucket_names() {
        let dir = TempDir::new().unwrap();
        let storage = open_bucket(&dir, "backup-bucket").await;

        let err = storage
            .put_object(&ObjectDescriptor::new("../escape").with_payload(&b"x"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidObjectKey));

        assert!(FsStorage::open(dir.path(), "192.168.0.1").await.is_err());
        assert!(FsStorage::open(dir.path(), "Upper").await.is_err());
    }

    #[tokio::test]
    async fn put_without_payload_fails() {
        let dir = TempDir::new().unwrap();
        let storage = open_bucket(&dir, "backup-bucket").await;

        let err = storage.put_object(&ObjectDescriptor::new("k")).await.unwrap_err();
        assert!(matches!(err, StorageError::MissingPayload(_)));
    }
}
