//! One pass of a mirror: the six-stage pipeline plus its error classifier
//! and stats reporter.

use crate::{
    models::object::ObjectDescriptor,
    pipeline::{
        ErrorStream, Pipeline, RunControl,
        classifier::{Classification, ErrorClassifier},
        error::PipelineError,
        stats::{StatsHandle, StatsReporter, StatsSnapshot},
        steps::{
            ANNOTATE_ETAG, FILTER_UNMODIFIED, FINALIZE, LIST_SOURCE, LOAD_OBJECT,
            REPLAY_RETRY_SET, UPLOAD_OBJECT,
            annotate::AnnotateEtag,
            filter::FilterUnmodified,
            finalize::Finalize,
            list::{ListSource, ReplayRetrySet},
            load::LoadObject,
            upload::UploadObject,
        },
    },
    services::storage::Storage,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::options::{REPLAY_BUFFER, RunOptions};

/// How a pass ended.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub classification: Classification,
    pub stats: StatsSnapshot,
    /// The pass was cut short by a drain or abort request.
    pub interrupted: bool,
}

impl RunOutcome {
    pub fn retry_set(&self) -> &[ObjectDescriptor] {
        &self.classification.retry_set
    }

    pub fn is_fatal(&self) -> bool {
        self.classification.fatal.is_some()
    }
}

/// A prepared, not yet started pass.
pub struct SyncRun {
    label: String,
    pipeline: Pipeline,
    errors: Option<ErrorStream>,
    stats_interval: Duration,
    outcome: Option<RunOutcome>,
}

/// Wire the stages of one pass. With a `retry_set`, the pass replays exactly
/// those objects instead of listing the source.
pub fn prepare_run(
    label: impl Into<String>,
    source: Arc<dyn Storage>,
    target: Arc<dyn Storage>,
    options: &RunOptions,
    retry_set: Option<Vec<ObjectDescriptor>>,
    control: RunControl,
) -> SyncRun {
    let workers = options.workers.max(1);
    let mut pipeline = Pipeline::new(control);
    pipeline.set_source(source).set_target(target);

    match retry_set {
        Some(objects) => pipeline.add_source(
            REPLAY_RETRY_SET,
            Arc::new(ReplayRetrySet::new(objects)),
            REPLAY_BUFFER,
        ),
        None => pipeline.add_source(
            LIST_SOURCE,
            Arc::new(ListSource::new(
                options.list_page_size,
                options.list_attempts,
                options.list_backoff,
            )),
            options.list_page_size,
        ),
    };

    pipeline
        .add_stage(FILTER_UNMODIFIED, Arc::new(FilterUnmodified), workers, workers)
        .add_stage(LOAD_OBJECT, Arc::new(LoadObject), workers, workers)
        .add_stage(ANNOTATE_ETAG, Arc::new(AnnotateEtag), 1, workers)
        .add_stage(UPLOAD_OBJECT, Arc::new(UploadObject), workers, workers)
        .add_stage(FINALIZE, Arc::new(Finalize), 1, workers);

    SyncRun {
        label: label.into(),
        pipeline,
        errors: None,
        stats_interval: options.stats_interval,
        outcome: None,
    }
}

impl SyncRun {
    /// Spawn all stage workers. Returns immediately.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let errors = self.pipeline.run()?;
        self.errors = Some(errors);
        info!(run = %self.label, "run started");
        Ok(())
    }

    /// The run's error stream; `None` before `start`.
    pub fn error_stream(&self) -> Option<ErrorStream> {
        self.errors.clone()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.pipeline.stats_snapshot()
    }

    pub fn stats_handle(&self) -> StatsHandle {
        self.pipeline.stats_handle()
    }

    pub fn control(&self) -> &RunControl {
        self.pipeline.control()
    }

    /// Objects to replay; `None` until the run has completed.
    pub fn retry_set(&self) -> Option<&[ObjectDescriptor]> {
        self.outcome.as_ref().map(RunOutcome::retry_set)
    }

    /// Start if needed, classify errors until the stream closes, wait for
    /// every worker and log the final stats.
    pub async fn complete(&mut self) -> Result<RunOutcome, PipelineError> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        if self.errors.is_none() {
            self.start()?;
        }
        let errors = self.errors.take().ok_or(PipelineError::NotStarted)?;

        let stop_reporter = CancellationToken::new();
        let reporter = StatsReporter::new(
            self.label.clone(),
            self.pipeline.stats_handle(),
            self.stats_interval,
        )
        .spawn(stop_reporter.clone());

        let control = self.pipeline.control().clone();
        let classification = ErrorClassifier::drain(errors, &control).await;
        self.pipeline.wait().await?;

        stop_reporter.cancel();
        let _ = reporter.await;

        // A fatal error aborts the run itself; that is not an interruption.
        let interrupted = classification.fatal.is_none() && control.was_cut_short();
        let outcome = RunOutcome {
            classification,
            stats: self.pipeline.stats_snapshot(),
            interrupted,
        };
        info!(
            run = %self.label,
            retry = outcome.retry_set().len(),
            fatal = outcome.is_fatal(),
            interrupted = outcome.interrupted,
            "run complete"
        );
        self.outcome = Some(outcome.clone());
        Ok(outcome)
    }
}
