//! Bucket identities, connection details and the filesystem catalog row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Namespace-scoped identity of a bucket claim, e.g. `team-a/uploads`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId {
    pub namespace: String,
    pub name: String,
}

impl BucketId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A (source bucket, destination bucket) mapping to mirror.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BucketPair {
    pub source: BucketId,
    pub target: BucketId,
}

/// Everything needed to open a storage client for one bucket.
///
/// `endpoint` selects the backend: `file:///path` opens the filesystem
/// backend rooted at `/path`, anything else is treated as an S3 endpoint URL.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BucketDetails {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub region: String,
}

// Secrets stay out of logs.
impl fmt::Debug for BucketDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketDetails")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .finish()
    }
}

/// Bucket row of the filesystem backend's SQLite catalog.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BucketRecord {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Bucket name (must conform to DNS naming rules).
    pub name: String,

    pub region: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secret() {
        let details = BucketDetails {
            endpoint: "http://rgw:80".into(),
            access_key_id: "AKIA".into(),
            secret_access_key: "super-secret".into(),
            bucket_name: "uploads".into(),
            region: "us-east-1".into(),
        };

        let rendered = format!("{:?}", details);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("uploads"));
    }

    #[test]
    fn bucket_id_display() {
        assert_eq!(BucketId::new("team-a", "uploads").to_string(), "team-a/uploads");
    }
}
