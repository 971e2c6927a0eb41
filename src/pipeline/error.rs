//! Error records produced by pipeline stages.
//!
//! Every failure is tagged with its `ErrorKind` where it happens; the
//! classifier only reads the tag.

use crate::{
    models::object::ObjectDescriptor,
    services::storage::{StorageError, StorageErrorKind},
};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Source or destination unusable. Ends the run.
    ConfigurationError,
    /// A single object failed; it goes to the retry set.
    ObjectError { object: ObjectDescriptor },
    /// The object vanished between listing and loading.
    NotExist { key: String },
    PermissionDenied { key: String },
    Other,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ConfigurationError => "configuration",
            Self::ObjectError { .. } => "object",
            Self::NotExist { .. } => "not-exist",
            Self::PermissionDenied { .. } => "permission-denied",
            Self::Other => "other",
        }
    }
}

/// One failure, sent once on the run's error channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    /// Name of the stage that produced the record.
    pub stage: String,
    pub kind: ErrorKind,
    pub cause: String,
}

impl ErrorRecord {
    pub fn new(stage: impl Into<String>, kind: ErrorKind, cause: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            kind,
            cause: cause.into(),
        }
    }

    pub fn configuration(stage: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::new(stage, ErrorKind::ConfigurationError, cause.to_string())
    }

    pub fn other(stage: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::new(stage, ErrorKind::Other, cause.to_string())
    }

    /// Tag a failed source read.
    pub fn from_load_failure(stage: &str, object: ObjectDescriptor, err: &StorageError) -> Self {
        if matches!(err.kind(), StorageErrorKind::NotFound) {
            return Self::new(stage, ErrorKind::NotExist { key: object.key }, err.to_string());
        }
        Self::from_object_failure(stage, object, err)
    }

    /// Tag a failed destination write. A missing key on write is retryable.
    pub fn from_upload_failure(stage: &str, object: ObjectDescriptor, err: &StorageError) -> Self {
        Self::from_object_failure(stage, object, err)
    }

    fn from_object_failure(stage: &str, object: ObjectDescriptor, err: &StorageError) -> Self {
        match err.kind() {
            StorageErrorKind::InvalidConfiguration => Self::configuration(stage, err),
            StorageErrorKind::PermissionDenied => Self::new(
                stage,
                ErrorKind::PermissionDenied { key: object.key },
                err.to_string(),
            ),
            StorageErrorKind::Transient | StorageErrorKind::NotFound => Self::new(
                stage,
                ErrorKind::ObjectError {
                    object: object.into_retry(),
                },
                err.to_string(),
            ),
            // Replaying would fail the same way.
            StorageErrorKind::Other => Self::other(stage, format!("`{}`: {}", object.key, err)),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::ConfigurationError)
    }

    /// Key of the affected object, when there is one.
    pub fn key(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::ObjectError { object } => Some(&object.key),
            ErrorKind::NotExist { key } | ErrorKind::PermissionDenied { key } => Some(key),
            ErrorKind::ConfigurationError | ErrorKind::Other => None,
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(
                f,
                "[{}] {} error on `{}`: {}",
                self.stage,
                self.kind.label(),
                key,
                self.cause
            ),
            None => write!(f, "[{}] {} error: {}", self.stage, self.kind.label(), self.cause),
        }
    }
}

/// Misuse of the pipeline builder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no source storage bound")]
    MissingSource,
    #[error("no target storage bound")]
    MissingTarget,
    #[error("pipeline has no source stage")]
    NoSource,
    #[error("pipeline has no stages after the source")]
    NoStages,
    #[error("pipeline already started")]
    AlreadyStarted,
    #[error("pipeline not started")]
    NotStarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_failures_are_tagged_at_the_source() {
        let object = ObjectDescriptor::new("a").with_payload(&b"x"[..]);
        let missing = StorageError::ObjectNotFound {
            bucket: "b".into(),
            key: "a".into(),
        };
        let record = ErrorRecord::from_load_failure("load-object", object.clone(), &missing);
        assert_eq!(record.kind, ErrorKind::NotExist { key: "a".into() });

        let flaky = StorageError::Transient("reset".into());
        let record = ErrorRecord::from_load_failure("load-object", object, &flaky);
        match record.kind {
            ErrorKind::ObjectError { object } => assert!(object.payload.is_none()),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn upload_not_found_is_still_retryable() {
        let object = ObjectDescriptor::new("a");
        let err = StorageError::ObjectNotFound {
            bucket: "b".into(),
            key: "a".into(),
        };
        let record = ErrorRecord::from_upload_failure("upload-object", object, &err);
        assert_eq!(record.key(), Some("a"));
        assert!(matches!(record.kind, ErrorKind::ObjectError { .. }));
        assert!(!record.is_fatal());
    }

    #[test]
    fn bucket_and_backend_failures_are_not_retried() {
        let object = ObjectDescriptor::new("a").with_payload(&b"x"[..]);

        let gone = StorageError::BucketNotFound("target".into());
        let record = ErrorRecord::from_upload_failure("upload-object", object.clone(), &gone);
        assert!(record.is_fatal());
        let record = ErrorRecord::from_load_failure("load-object", object.clone(), &gone);
        assert!(record.is_fatal());

        let broken = StorageError::MissingPayload("a".into());
        let record = ErrorRecord::from_upload_failure("upload-object", object, &broken);
        assert_eq!(record.kind, ErrorKind::Other);
        assert!(record.cause.starts_with("`a`: "));
    }

    #[test]
    fn display_names_stage_and_key() {
        let record = ErrorRecord::new(
            "upload-object",
            ErrorKind::PermissionDenied { key: "k".into() },
            "denied",
        );
        assert_eq!(
            record.to_string(),
            "[upload-object] permission-denied error on `k`: denied"
        );
    }
}
