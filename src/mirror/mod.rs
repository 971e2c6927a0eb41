//! Mirroring one bucket into another with bounded retry passes.

pub mod options;
pub mod run;

pub use options::RunOptions;
pub use run::{RunOutcome, SyncRun, prepare_run};

use crate::{
    models::object::ObjectDescriptor,
    pipeline::{RunControl, error::ErrorRecord, steps::UPLOAD_OBJECT},
    services::{
        status_board::{PairSummary, StatusBoard},
        storage::Storage,
    },
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum SyncError {
    #[error("mirror aborted: {0}")]
    Fatal(String),
    #[error("{} object(s) still failing after all passes", .keys.len())]
    Incomplete { keys: Vec<String> },
    #[error("mirror finished with an unclassified error: {0}")]
    Unclassified(String),
    #[error("mirror interrupted before completion")]
    Interrupted,
}

/// Result of mirroring one bucket pair across all passes.
#[derive(Debug, Clone, Default)]
pub struct PairReport {
    pub name: String,
    pub passes: u32,
    /// Objects written to the destination, over all passes.
    pub uploaded: u64,
    /// `NotExist` / `PermissionDenied` records, over all passes.
    pub skipped: usize,
    pub fatal: Option<ErrorRecord>,
    /// Keys still in the retry set after the last pass.
    pub failed_keys: Vec<String>,
    pub last_error: Option<ErrorRecord>,
    pub interrupted: bool,
}

impl PairReport {
    /// Success means: nothing fatal, nothing left to retry, no unclassified
    /// error, and the run was not cut short.
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
            && self.failed_keys.is_empty()
            && self.last_error.is_none()
            && !self.interrupted
    }

    pub fn into_result(self) -> Result<PairReport, SyncError> {
        if let Some(fatal) = &self.fatal {
            return Err(SyncError::Fatal(fatal.to_string()));
        }
        if self.interrupted {
            return Err(SyncError::Interrupted);
        }
        if !self.failed_keys.is_empty() {
            return Err(SyncError::Incomplete {
                keys: self.failed_keys,
            });
        }
        if let Some(last) = &self.last_error {
            return Err(SyncError::Unclassified(last.to_string()));
        }
        Ok(self)
    }

    pub fn summary(&self) -> PairSummary {
        PairSummary {
            name: self.name.clone(),
            passes: self.passes,
            uploaded: self.uploaded,
            skipped: self.skipped,
            failed_keys: self.failed_keys.len(),
            success: self.is_success(),
            error: self
                .fatal
                .as_ref()
                .or(self.last_error.as_ref())
                .map(ToString::to_string),
        }
    }
}

/// Mirror `source` into `target`: one listing pass, then replays of the
/// retry set until it is empty, a fatal error occurs, the run is drained or
/// aborted, or `options.max_passes` passes have run.
pub async fn mirror_bucket(
    name: &str,
    source: Arc<dyn Storage>,
    target: Arc<dyn Storage>,
    options: &RunOptions,
    control: &RunControl,
    board: Option<&StatusBoard>,
) -> PairReport {
    let mut report = PairReport {
        name: name.to_string(),
        ..PairReport::default()
    };
    let mut retry_set: Option<Vec<ObjectDescriptor>> = None;
    let max_passes = options.max_passes.max(1);

    info!(pair = %name, source = %source.describe(), target = %target.describe(), "mirroring bucket");

    for pass in 1..=max_passes {
        let label = format!("{name}#{pass}");
        let mut run = prepare_run(
            label,
            source.clone(),
            target.clone(),
            options,
            retry_set.take(),
            control.child(),
        );
        if let Some(board) = board {
            board.run_started(name, pass, run.stats_handle());
        }

        let outcome = match run.complete().await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(pair = %name, pass, error = %err, "pipeline could not run");
                report.fatal = Some(ErrorRecord::configuration("pipeline", err));
                break;
            }
        };

        report.passes = pass;
        report.uploaded += outcome
            .stats
            .get(UPLOAD_OBJECT)
            .map(|stage| stage.counters.items_out)
            .unwrap_or_default();

        let mut classification = outcome.classification;
        report.skipped += classification.skipped.len();
        report.failed_keys = classification.retry_keys();
        if let Some(last) = classification.last_error.take() {
            report.last_error = Some(last);
        }

        if let Some(fatal) = classification.fatal {
            report.fatal = Some(fatal);
            break;
        }
        if outcome.interrupted {
            warn!(pair = %name, pass, "mirror interrupted");
            report.interrupted = true;
            break;
        }
        if classification.retry_set.is_empty() {
            break;
        }
        // Pending retries are not replayed once a stop was requested.
        if control.is_draining() || control.is_aborted() {
            warn!(pair = %name, pass, retry = classification.retry_set.len(), "mirror interrupted before replay");
            report.interrupted = true;
            break;
        }
        if pass < max_passes {
            info!(pair = %name, pass, retry = classification.retry_set.len(), "replaying failed objects");
            retry_set = Some(classification.retry_set);
        }
    }

    if report.is_success() {
        info!(pair = %name, passes = report.passes, uploaded = report.uploaded, "mirror succeeded");
    } else {
        error!(
            pair = %name,
            passes = report.passes,
            failed = report.failed_keys.len(),
            fatal = report.fatal.is_some(),
            "mirror failed"
        );
    }
    if let Some(board) = board {
        board.pair_finished(report.summary());
    }
    report
}
