//! src/services/storage.rs
//!
//! The `Storage` seam between the sync pipeline and concrete object stores.
//! A `Storage` is bound to a single bucket. Implementations must be safe for
//! concurrent use: filter and upload workers share the destination client.

use crate::models::{bucket::BucketDetails, object::ObjectDescriptor};
use async_trait::async_trait;
use std::{fmt, io, sync::Arc};
use thiserror::Error;

use super::{fs_storage::FsStorage, s3_storage::S3Storage};

/// Endpoint scheme selecting the filesystem backend.
pub const FILE_SCHEME: &str = "file://";

/// One page of a bucket listing.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectDescriptor>,
    /// Opaque token for the next page; `None` on the last page.
    pub next_continuation_token: Option<String>,
}

/// What went wrong, decided by the backend where the failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// The object (or version) does not exist.
    NotFound,
    /// Credentials are valid but not allowed to perform the operation.
    PermissionDenied,
    /// Bucket missing, credentials rejected, endpoint unusable.
    InvalidConfiguration,
    /// Network hiccup, throttling, 5xx. Worth another attempt.
    Transient,
    Other,
}

impl StorageErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Other)
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::InvalidConfiguration => "invalid configuration",
            Self::Transient => "transient",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("object `{0}` has no payload loaded")]
    MissingPayload(String),
    #[error("access denied: {0}")]
    PermissionDenied(String),
    #[error("invalid storage configuration: {0}")]
    InvalidConfiguration(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            Self::BucketNotFound(_)
            | Self::InvalidBucketName { .. }
            | Self::InvalidConfiguration(_) => StorageErrorKind::InvalidConfiguration,
            Self::ObjectNotFound { .. } => StorageErrorKind::NotFound,
            Self::PermissionDenied(_) => StorageErrorKind::PermissionDenied,
            Self::Transient(_) => StorageErrorKind::Transient,
            Self::InvalidObjectKey | Self::MissingPayload(_) | Self::Backend(_) => {
                StorageErrorKind::Other
            }
            Self::Sqlx(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StorageErrorKind::Transient,
                sqlx::Error::RowNotFound => StorageErrorKind::NotFound,
                _ => StorageErrorKind::Other,
            },
            Self::Io(err) => match err.kind() {
                io::ErrorKind::NotFound => StorageErrorKind::NotFound,
                io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => StorageErrorKind::Transient,
                _ => StorageErrorKind::Other,
            },
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Object-store operations the sync pipeline and provisioner need.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Human-readable location, e.g. `s3://http://rgw:80/uploads`.
    fn describe(&self) -> String;

    /// List up to `max_keys` objects after `continuation_token`, in key order.
    async fn list_page(
        &self,
        continuation_token: Option<String>,
        max_keys: usize,
    ) -> StorageResult<ListPage>;

    /// Fetch metadata (including ETag and user metadata) without the payload.
    async fn head_object(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> StorageResult<ObjectDescriptor>;

    /// Fetch metadata and payload.
    async fn get_object(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> StorageResult<ObjectDescriptor>;

    /// Write `object.payload` with `object.metadata` under `object.key`.
    async fn put_object(&self, object: &ObjectDescriptor) -> StorageResult<()>;

    async fn bucket_exists(&self) -> StorageResult<bool>;

    async fn create_bucket(&self) -> StorageResult<()>;
}

/// Opens bucket-bound storage clients from resolved connection details.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn open(&self, details: &BucketDetails) -> StorageResult<Arc<dyn Storage>>;
}

/// Picks the filesystem backend for `file://` endpoints and S3 otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStorageFactory;

#[async_trait]
impl StorageFactory for DefaultStorageFactory {
    async fn open(&self, details: &BucketDetails) -> StorageResult<Arc<dyn Storage>> {
        match details.endpoint.strip_prefix(FILE_SCHEME) {
            Some(root) => {
                let storage = FsStorage::open(root, &details.bucket_name).await?;
                Ok(Arc::new(storage))
            }
            None => Ok(Arc::new(S3Storage::new(details)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_kinds() {
        let missing = StorageError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(missing.kind(), StorageErrorKind::NotFound);

        let denied = StorageError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert_eq!(denied.kind(), StorageErrorKind::PermissionDenied);
    }

    #[test]
    fn missing_bucket_is_configuration() {
        let err = StorageError::BucketNotFound("uploads".into());
        assert_eq!(err.kind(), StorageErrorKind::InvalidConfiguration);
        assert!(!err.kind().is_retryable());
        assert!(StorageErrorKind::Transient.is_retryable());
    }
}
