//! Represents an object (file) moving between two buckets.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::metadata::Metadata;

/// One storage object in transit through the sync pipeline.
///
/// The lister fills `key`, `version_id` and `etag`; the loader adds the
/// payload and the source's authoritative metadata. A descriptor is owned by
/// exactly one pipeline worker at a time and is handed downstream by value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectDescriptor {
    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Version identifier on versioned stores.
    pub version_id: Option<String>,

    /// Content digest as reported by the store. Opaque; only ever compared.
    pub etag: Option<String>,

    /// Size in bytes, when known.
    pub size: Option<i64>,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Timestamp when the object was last modified.
    pub last_modified: Option<DateTime<Utc>>,

    /// User metadata, including reserved fields written by this engine.
    pub metadata: Metadata,

    /// Payload bytes, absent until loaded.
    pub payload: Option<Bytes>,
}

impl ObjectDescriptor {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        self.size = Some(payload.len() as i64);
        self.payload = Some(payload);
        self
    }

    /// Strip everything a replay will load again, keeping the identity.
    ///
    /// Retry sets can hold thousands of entries; they must not pin payloads.
    pub fn into_retry(mut self) -> Self {
        self.payload = None;
        self.metadata = Metadata::new();
        self
    }
}

/// Object row of the filesystem backend's SQLite catalog.
///
/// Stores the object's metadata, not the content bytes.
#[derive(Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    pub key: String,

    pub content_type: Option<String>,

    pub size_bytes: i64,

    /// MD5 of the payload as written by the backend.
    pub etag: Option<String>,

    pub last_modified: DateTime<Utc>,

    pub version_id: Option<String>,
}

impl ObjectRecord {
    /// Convert into a descriptor, attaching the separately stored metadata.
    pub fn into_descriptor(self, metadata: Metadata) -> ObjectDescriptor {
        ObjectDescriptor {
            key: self.key,
            version_id: self.version_id,
            etag: self.etag,
            size: Some(self.size_bytes),
            content_type: self.content_type,
            last_modified: Some(self.last_modified),
            metadata,
            payload: None,
        }
    }
}
