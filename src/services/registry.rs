//! src/services/registry.rs
//!
//! Where bucket pairs and their credentials come from, and how target
//! buckets get provisioned. The sync core only sees the three traits; the
//! binary wires them to a JSON manifest and a storage-backed provisioner.

use crate::models::bucket::{BucketDetails, BucketId, BucketPair};
use async_trait::async_trait;
use serde::Deserialize;
use std::{path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::storage::{StorageError, StorageFactory};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("credentials for bucket `{0}` are unavailable")]
    CredentialsUnavailable(BucketId),
    #[error("target bucket `{bucket}` not ready after {attempts} checks")]
    TargetNotReady { bucket: String, attempts: u32 },
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Lists the bucket pairs to mirror.
#[async_trait]
pub trait ClaimRegistry: Send + Sync {
    async fn list_bucket_pairs(&self) -> Result<Vec<BucketPair>, RegistryError>;
}

/// Resolves a bucket identity to connection details.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, bucket: &BucketId) -> Result<BucketDetails, RegistryError>;
}

/// Makes sure a target bucket exists and is ready to receive objects.
#[async_trait]
pub trait TargetProvisioner: Send + Sync {
    async fn ensure_target(&self, bucket: &BucketId) -> Result<(), RegistryError>;
}

/// Name of the backup bucket for a claim: `{prefix}-{namespace}-{claim}`.
pub fn target_bucket_name(prefix: &str, source: &BucketId) -> String {
    format!("{}-{}-{}", prefix, source.namespace, source.name)
}

/// One bucket claim in the manifest, with its resolved connection details.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimEntry {
    pub namespace: String,
    pub name: String,
    pub bucket_name: String,
    #[serde(default)]
    pub region: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl ClaimEntry {
    fn id(&self) -> BucketId {
        BucketId::new(&self.namespace, &self.name)
    }

    fn details(&self) -> BucketDetails {
        BucketDetails {
            endpoint: self.endpoint.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            bucket_name: self.bucket_name.clone(),
            region: self.region.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    claims: Vec<ClaimEntry>,
}

/// Where and under which names backups are written.
#[derive(Debug, Clone)]
pub struct TargetSettings {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub bucket_prefix: String,
    /// Namespace the target identities live in.
    pub namespace: String,
}

/// Registry and resolver backed by a JSON manifest of bucket claims.
///
/// ```json
/// { "claims": [ { "namespace": "team-a", "name": "uploads",
///                 "bucket_name": "uploads-5f2c", "region": "us-east-1",
///                 "endpoint": "http://rgw:80",
///                 "access_key_id": "...", "secret_access_key": "..." } ] }
/// ```
#[derive(Debug, Clone)]
pub struct ManifestRegistry {
    claims: Vec<ClaimEntry>,
    target: TargetSettings,
}

impl ManifestRegistry {
    pub fn new(claims: Vec<ClaimEntry>, target: TargetSettings) -> Self {
        Self { claims, target }
    }

    pub fn from_json(json: &str, target: TargetSettings) -> Result<Self, RegistryError> {
        let manifest: Manifest =
            serde_json::from_str(json).map_err(|e| RegistryError::Manifest(e.to_string()))?;
        Ok(Self::new(manifest.claims, target))
    }

    pub async fn from_path(path: &Path, target: TargetSettings) -> Result<Self, RegistryError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RegistryError::Manifest(format!("{}: {}", path.display(), e)))?;
        let registry = Self::from_json(&json, target)?;
        info!(path = %path.display(), claims = registry.claims.len(), "loaded claim manifest");
        Ok(registry)
    }

    fn target_id(&self, source: &BucketId) -> BucketId {
        BucketId::new(
            &self.target.namespace,
            target_bucket_name(&self.target.bucket_prefix, source),
        )
    }

    fn is_target(&self, bucket: &BucketId) -> bool {
        bucket.namespace == self.target.namespace
            && self
                .claims
                .iter()
                .any(|claim| self.target_id(&claim.id()) == *bucket)
    }
}

#[async_trait]
impl ClaimRegistry for ManifestRegistry {
    async fn list_bucket_pairs(&self) -> Result<Vec<BucketPair>, RegistryError> {
        Ok(self
            .claims
            .iter()
            .map(|claim| {
                let source = claim.id();
                let target = self.target_id(&source);
                BucketPair { source, target }
            })
            .collect())
    }
}

#[async_trait]
impl CredentialResolver for ManifestRegistry {
    async fn resolve(&self, bucket: &BucketId) -> Result<BucketDetails, RegistryError> {
        if let Some(claim) = self.claims.iter().find(|claim| claim.id() == *bucket) {
            return Ok(claim.details());
        }

        if self.is_target(bucket) {
            return Ok(BucketDetails {
                endpoint: self.target.endpoint.clone(),
                access_key_id: self.target.access_key_id.clone(),
                secret_access_key: self.target.secret_access_key.clone(),
                bucket_name: bucket.name.clone(),
                region: self.target.region.clone(),
            });
        }

        Err(RegistryError::CredentialsUnavailable(bucket.clone()))
    }
}

/// Creates missing target buckets and waits until they answer.
pub struct BucketProvisioner {
    resolver: Arc<dyn CredentialResolver>,
    factory: Arc<dyn StorageFactory>,
    attempts: u32,
    delay: Duration,
}

impl BucketProvisioner {
    pub fn new(resolver: Arc<dyn CredentialResolver>, factory: Arc<dyn StorageFactory>) -> Self {
        Self {
            resolver,
            factory,
            attempts: 10,
            delay: Duration::from_secs(1),
        }
    }

    /// How often and how far apart readiness is polled after creation.
    pub fn with_readiness(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.delay = delay;
        self
    }
}

#[async_trait]
impl TargetProvisioner for BucketProvisioner {
    async fn ensure_target(&self, bucket: &BucketId) -> Result<(), RegistryError> {
        let details = self.resolver.resolve(bucket).await?;
        let storage = self.factory.open(&details).await?;

        if storage.bucket_exists().await? {
            debug!(bucket = %bucket, "target bucket already exists");
            return Ok(());
        }

        info!(bucket = %bucket, location = %storage.describe(), "creating target bucket");
        storage.create_bucket().await?;

        for attempt in 1..=self.attempts {
            if storage.bucket_exists().await? {
                return Ok(());
            }
            warn!(bucket = %bucket, attempt, "target bucket not ready yet");
            tokio::time::sleep(self.delay).await;
        }

        Err(RegistryError::TargetNotReady {
            bucket: bucket.to_string(),
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{memory_storage::MemoryStorageFactory, storage::Storage};

    const MANIFEST: &str = r#"{
        "claims": [
            {
                "namespace": "team-a",
                "name": "uploads",
                "bucket_name": "uploads-5f2c",
                "region": "eu-central-1",
                "endpoint": "http://rgw-a:80",
                "access_key_id": "AK-A",
                "secret_access_key": "SK-A"
            },
            {
                "namespace": "team-b",
                "name": "logs",
                "bucket_name": "logs-9d1e",
                "endpoint": "http://rgw-b:80",
                "access_key_id": "AK-B",
                "secret_access_key": "SK-B"
            }
        ]
    }"#;

    fn settings() -> TargetSettings {
        TargetSettings {
            endpoint: "http://backup:9000".into(),
            access_key_id: "AK-T".into(),
            secret_access_key: "SK-T".into(),
            region: "us-east-1".into(),
            bucket_prefix: "backup".into(),
            namespace: "backup".into(),
        }
    }

    #[tokio::test]
    async fn pairs_use_prefixed_target_names() {
        let registry = ManifestRegistry::from_json(MANIFEST, settings()).unwrap();
        let pairs = registry.list_bucket_pairs().await.unwrap();

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].source, BucketId::new("team-a", "uploads"));
        assert_eq!(pairs[0].target, BucketId::new("backup", "backup-team-a-uploads"));
        assert_eq!(pairs[1].target.name, "backup-team-b-logs");
    }

    #[tokio::test]
    async fn resolves_sources_and_targets() {
        let registry = ManifestRegistry::from_json(MANIFEST, settings()).unwrap();

        let source = registry
            .resolve(&BucketId::new("team-a", "uploads"))
            .await
            .unwrap();
        assert_eq!(source.bucket_name, "uploads-5f2c");
        assert_eq!(source.endpoint, "http://rgw-a:80");

        let target = registry
            .resolve(&BucketId::new("backup", "backup-team-b-logs"))
            .await
            .unwrap();
        assert_eq!(target.bucket_name, "backup-team-b-logs");
        assert_eq!(target.access_key_id, "AK-T");

        let err = registry
            .resolve(&BucketId::new("team-c", "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CredentialsUnavailable(_)));
    }

    #[test]
    fn malformed_manifest_is_rejected() {
        let err = ManifestRegistry::from_json("{\"claims\": 3}", settings()).unwrap_err();
        assert!(matches!(err, RegistryError::Manifest(_)));
    }

    #[tokio::test]
    async fn provisioner_creates_missing_target() {
        let registry = Arc::new(ManifestRegistry::from_json(MANIFEST, settings()).unwrap());
        let factory = Arc::new(MemoryStorageFactory::new());
        let provisioner = BucketProvisioner::new(registry, factory.clone())
            .with_readiness(2, Duration::from_millis(1));

        let target = BucketId::new("backup", "backup-team-a-uploads");
        provisioner.ensure_target(&target).await.unwrap();
        provisioner.ensure_target(&target).await.unwrap();

        let bucket = factory.bucket("backup-team-a-uploads").unwrap();
        assert!(bucket.bucket_exists().await.unwrap());
    }
}
