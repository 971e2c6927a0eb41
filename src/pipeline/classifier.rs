//! Drains a run's error channel and sorts every record into fatal,
//! retryable or skipped.

use crate::models::object::ObjectDescriptor;
use std::ops::ControlFlow;
use tracing::{error, info, warn};

use super::{
    ErrorStream, RunControl,
    error::{ErrorKind, ErrorRecord},
};

/// Result of classifying one run's errors.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// Objects to replay in the next pass, payloads stripped.
    pub retry_set: Vec<ObjectDescriptor>,
    /// First `ConfigurationError`, if any. The run was aborted on it.
    pub fatal: Option<ErrorRecord>,
    /// Most recent `Other` error.
    pub last_error: Option<ErrorRecord>,
    /// `NotExist` and `PermissionDenied` records.
    pub skipped: Vec<ErrorRecord>,
}

impl Classification {
    /// Sort one record. `Break` means the run must stop now.
    pub fn absorb(&mut self, record: ErrorRecord) -> ControlFlow<()> {
        match record.kind {
            ErrorKind::ConfigurationError => {
                error!(stage = %record.stage, cause = %record.cause, "configuration error, aborting run");
                self.fatal = Some(record);
                return ControlFlow::Break(());
            }
            ErrorKind::ObjectError { ref object } => {
                warn!(stage = %record.stage, key = %object.key, cause = %record.cause, "object failed, queued for retry");
                self.retry_set.push(object.clone());
            }
            ErrorKind::NotExist { ref key } => {
                info!(stage = %record.stage, key = %key, "object no longer exists, skipping");
                self.skipped.push(record);
            }
            ErrorKind::PermissionDenied { ref key } => {
                warn!(stage = %record.stage, key = %key, cause = %record.cause, "permission denied, skipping");
                self.skipped.push(record);
            }
            ErrorKind::Other => {
                warn!(stage = %record.stage, cause = %record.cause, "unclassified error, skipping");
                self.last_error = Some(record);
            }
        }
        ControlFlow::Continue(())
    }

    pub fn retry_keys(&self) -> Vec<String> {
        self.retry_set.iter().map(|o| o.key.clone()).collect()
    }
}

/// Consumer of a run's error stream.
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Read `errors` until it closes or a fatal record arrives. A fatal
    /// record aborts `control` and stops the draining.
    pub async fn drain(errors: ErrorStream, control: &RunControl) -> Classification {
        let mut classification = Classification::default();
        while let Ok(record) = errors.recv().await {
            if classification.absorb(record).is_break() {
                control.abort();
                break;
            }
        }
        classification
    }
}
