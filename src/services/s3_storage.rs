//! src/services/s3_storage.rs
//!
//! S3-compatible backend on top of `aws-sdk-s3`: static credentials, custom
//! endpoint, path-style addressing. SDK failures are classified into a
//! `StorageErrorKind` right here, where the response status and error code
//! are still at hand.

use crate::models::{bucket::BucketDetails, metadata::Metadata, object::ObjectDescriptor};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Builder, Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::{ByteStream, DateTime as SmithyDateTime},
    types::{BucketLocationConstraint, CreateBucketConfiguration},
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, error::Error as StdError};
use tracing::debug;

use super::storage::{ListPage, Storage, StorageError, StorageErrorKind, StorageResult};

const CREDENTIALS_PROVIDER: &str = "bucket-mirror";
const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Storage {
    client: Client,
    endpoint: String,
    bucket: String,
    region: String,
}

impl S3Storage {
    pub fn new(details: &BucketDetails) -> StorageResult<Self> {
        if details.endpoint.trim().is_empty() {
            return Err(StorageError::InvalidConfiguration(
                "S3 endpoint must not be empty".into(),
            ));
        }
        if details.bucket_name.trim().is_empty() {
            return Err(StorageError::InvalidConfiguration(
                "bucket name must not be empty".into(),
            ));
        }

        let region = if details.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            details.region.clone()
        };

        let credentials = Credentials::new(
            &details.access_key_id,
            &details.secret_access_key,
            None,
            None,
            CREDENTIALS_PROVIDER,
        );
        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.clone()))
            .endpoint_url(&details.endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            endpoint: details.endpoint.clone(),
            bucket: details.bucket_name.clone(),
            region,
        })
    }

    /// Map an SDK failure onto the storage taxonomy using the S3 error code
    /// first and the HTTP status second.
    fn classify_sdk_error<E>(&self, operation: &str, key: &str, err: SdkError<E>) -> StorageError
    where
        E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    {
        let status = err.raw_response().map(|response| response.status().as_u16());
        let code = err.code().map(str::to_string);
        let message = format!(
            "{operation} `{}/{key}`: {}",
            self.bucket,
            DisplayErrorContext(&err)
        );

        let kind = match (code.as_deref(), status) {
            (Some("NoSuchKey" | "NotFound" | "NoSuchVersion"), _) | (_, Some(404))
                if code.as_deref() != Some("NoSuchBucket") =>
            {
                StorageErrorKind::NotFound
            }
            (
                Some(
                    "NoSuchBucket" | "InvalidAccessKeyId" | "SignatureDoesNotMatch"
                    | "InvalidBucketName",
                ),
                _,
            ) => StorageErrorKind::InvalidConfiguration,
            (Some("AccessDenied" | "AllAccessDisabled"), _) | (_, Some(403)) => {
                StorageErrorKind::PermissionDenied
            }
            (Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable"), _) => {
                StorageErrorKind::Transient
            }
            (_, Some(429 | 500..=599)) => StorageErrorKind::Transient,
            _ if matches!(
                err,
                SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
            ) =>
            {
                StorageErrorKind::Transient
            }
            _ if matches!(err, SdkError::ConstructionFailure(_)) => {
                StorageErrorKind::InvalidConfiguration
            }
            _ => StorageErrorKind::Other,
        };

        match kind {
            StorageErrorKind::NotFound => StorageError::ObjectNotFound {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            },
            StorageErrorKind::PermissionDenied => StorageError::PermissionDenied(message),
            StorageErrorKind::InvalidConfiguration => StorageError::InvalidConfiguration(message),
            StorageErrorKind::Transient => StorageError::Transient(message),
            StorageErrorKind::Other => StorageError::Backend(message),
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.endpoint, self.bucket)
    }

    async fn list_page(
        &self,
        continuation_token: Option<String>,
        max_keys: usize,
    ) -> StorageResult<ListPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(max_keys.min(i32::MAX as usize) as i32)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|e| self.classify_sdk_error("list_objects_v2", "", e))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?;
                Some(ObjectDescriptor {
                    key: key.to_string(),
                    etag: object.e_tag().map(str::to_string),
                    size: object.size(),
                    last_modified: object.last_modified().and_then(to_chrono),
                    ..ObjectDescriptor::default()
                })
            })
            .collect();

        let next_continuation_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            next_continuation_token,
        })
    }

    async fn head_object(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> StorageResult<ObjectDescriptor> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string))
            .send()
            .await
            .map_err(|e| self.classify_sdk_error("head_object", key, e))?;

        Ok(ObjectDescriptor {
            key: key.to_string(),
            version_id: output.version_id().map(str::to_string),
            etag: output.e_tag().map(str::to_string),
            size: output.content_length(),
            content_type: output.content_type().map(str::to_string),
            last_modified: output.last_modified().and_then(to_chrono),
            metadata: collect_metadata(output.metadata()),
            payload: None,
        })
    }

    async fn get_object(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> StorageResult<ObjectDescriptor> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string))
            .send()
            .await
            .map_err(|e| self.classify_sdk_error("get_object", key, e))?;

        let mut object = ObjectDescriptor {
            key: key.to_string(),
            version_id: output.version_id().map(str::to_string),
            etag: output.e_tag().map(str::to_string),
            size: output.content_length(),
            content_type: output.content_type().map(str::to_string),
            last_modified: output.last_modified().and_then(to_chrono),
            metadata: collect_metadata(output.metadata()),
            payload: None,
        };

        // A body that breaks off mid-stream is a network problem.
        let payload = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Transient(format!("reading body of `{key}`: {e}")))?
            .into_bytes();
        object.size = Some(payload.len() as i64);
        object.payload = Some(payload);
        Ok(object)
    }

    async fn put_object(&self, object: &ObjectDescriptor) -> StorageResult<()> {
        let payload = object
            .payload
            .clone()
            .ok_or_else(|| StorageError::MissingPayload(object.key.clone()))?;

        let metadata: HashMap<String, String> = object
            .metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object.key)
            .body(ByteStream::from(payload))
            .set_content_type(object.content_type.clone())
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| self.classify_sdk_error("put_object", &object.key, e))?;

        debug!(bucket = %self.bucket, key = %object.key, "uploaded object");
        Ok(())
    }

    async fn bucket_exists(&self) -> StorageResult<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = self.classify_sdk_error("head_bucket", "", e);
                match err.kind() {
                    StorageErrorKind::NotFound | StorageErrorKind::InvalidConfiguration => {
                        Ok(false)
                    }
                    _ => Err(err),
                }
            }
        }
    }

    async fn create_bucket(&self) -> StorageResult<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.code(), Some("BucketAlreadyOwnedByYou")) => Ok(()),
            Err(e) => Err(self.classify_sdk_error("create_bucket", "", e)),
        }
    }
}

fn collect_metadata(metadata: Option<&HashMap<String, String>>) -> Metadata {
    metadata
        .into_iter()
        .flatten()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect()
}

fn to_chrono(timestamp: &SmithyDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(endpoint: &str, bucket: &str) -> BucketDetails {
        BucketDetails {
            endpoint: endpoint.into(),
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            bucket_name: bucket.into(),
            region: String::new(),
        }
    }

    #[test]
    fn empty_endpoint_is_configuration_error() {
        let err = S3Storage::new(&details("", "uploads")).err().unwrap();
        assert_eq!(err.kind(), StorageErrorKind::InvalidConfiguration);
    }

    #[test]
    fn defaults_region_and_describes_location() {
        let storage = S3Storage::new(&details("http://rgw:80", "uploads")).unwrap();
        assert_eq!(storage.region, DEFAULT_REGION);
        assert_eq!(storage.describe(), "s3://http://rgw:80/uploads");
    }

    #[test]
    fn collects_lowercase_metadata() {
        let mut raw = HashMap::new();
        raw.insert("X-Original-ETag".to_string(), "\"abc-3\"".to_string());
        let metadata = collect_metadata(Some(&raw));
        assert_eq!(metadata.original_etag(), Some("\"abc-3\""));
    }
}
