//! Staged, concurrent object pipeline.
//!
//! A `Pipeline` is a source stage followed by step stages, wired with
//! bounded MPMC channels. Each stage runs its declared number of worker
//! tasks; when a stage's input closes and its workers finish, its output
//! closes in turn, so shutdown cascades from the source to the last stage.
//! Failures travel on one shared, unbounded error channel.

pub mod classifier;
pub mod error;
pub mod stage;
pub mod stats;
pub mod steps;

use crate::{models::object::ObjectDescriptor, services::storage::Storage};
use async_channel::Receiver;
use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error};

use self::{
    error::{ErrorRecord, PipelineError},
    stage::{SourceFn, StepContext, StepFn, run_source, run_step},
    stats::{StageInfo, StageStats, StatsHandle, StatsSnapshot},
};

/// Receiving end of a run's error channel. Closes once every worker is done.
pub type ErrorStream = Receiver<ErrorRecord>;

/// Drain and abort signals for a run.
///
/// Draining stops the source; in-flight objects still finish. Aborting stops
/// every worker at its next suspension point.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    drain: CancellationToken,
    abort: CancellationToken,
    /// Set when a worker or the source actually stopped early because of
    /// a drain or abort. A request arriving after the work is done leaves it
    /// unset.
    cut_short: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) {
        self.drain.cancel();
    }

    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn drained(&self) -> WaitForCancellationFuture<'_> {
        self.drain.cancelled()
    }

    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.abort.cancelled()
    }

    pub(crate) fn note_cut_short(&self) {
        self.cut_short.store(true, Ordering::Relaxed);
    }

    /// Whether work of this run was left undone because of a drain or abort.
    pub fn was_cut_short(&self) -> bool {
        self.cut_short.load(Ordering::Relaxed)
    }

    /// Scoped control: follows this one, but can be drained or aborted
    /// without touching it. Starts with its own, unset cut-short flag.
    pub fn child(&self) -> Self {
        Self {
            drain: self.drain.child_token(),
            abort: self.abort.child_token(),
            cut_short: Arc::default(),
        }
    }
}

enum StageBody {
    Source(Arc<dyn SourceFn>),
    Step(Arc<dyn StepFn>),
}

struct StageSpec {
    info: StageInfo,
    body: StageBody,
    buffer: usize,
}

pub struct Pipeline {
    control: RunControl,
    source: Option<Arc<dyn Storage>>,
    target: Option<Arc<dyn Storage>>,
    stages: Vec<StageSpec>,
    started: Arc<OnceLock<Instant>>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(control: RunControl) -> Self {
        Self {
            control,
            source: None,
            target: None,
            stages: Vec::new(),
            started: Arc::new(OnceLock::new()),
            handles: Vec::new(),
        }
    }

    pub fn set_source(&mut self, storage: Arc<dyn Storage>) -> &mut Self {
        self.source = Some(storage);
        self
    }

    pub fn set_target(&mut self, storage: Arc<dyn Storage>) -> &mut Self {
        self.target = Some(storage);
        self
    }

    /// Register the head stage. It runs a single worker.
    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        source: Arc<dyn SourceFn>,
        buffer: usize,
    ) -> &mut Self {
        self.push(name.into(), StageBody::Source(source), 1, buffer)
    }

    /// Register a step stage, consuming the previous stage's output.
    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        step: Arc<dyn StepFn>,
        workers: usize,
        buffer: usize,
    ) -> &mut Self {
        self.push(name.into(), StageBody::Step(step), workers, buffer)
    }

    fn push(&mut self, name: String, body: StageBody, workers: usize, buffer: usize) -> &mut Self {
        let info = StageInfo {
            num: self.stages.len(),
            name,
            workers: workers.max(1),
            stats: Arc::new(StageStats::default()),
        };
        self.stages.push(StageSpec {
            info,
            body,
            buffer: buffer.max(1),
        });
        self
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle::new(
            self.stages.iter().map(|spec| spec.info.clone()).collect(),
            self.started.clone(),
        )
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats_handle().snapshot()
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    fn validate(&self) -> Result<(Arc<dyn Storage>, Arc<dyn Storage>), PipelineError> {
        if self.started.get().is_some() {
            return Err(PipelineError::AlreadyStarted);
        }
        let source = self.source.clone().ok_or(PipelineError::MissingSource)?;
        let target = self.target.clone().ok_or(PipelineError::MissingTarget)?;

        match self.stages.split_first() {
            None => Err(PipelineError::NoSource),
            Some((head, _)) if !matches!(head.body, StageBody::Source(_)) => {
                Err(PipelineError::NoSource)
            }
            Some((_, [])) => Err(PipelineError::NoStages),
            Some((_, rest)) if rest.iter().any(|s| matches!(s.body, StageBody::Source(_))) => {
                Err(PipelineError::NoSource)
            }
            Some(_) => Ok((source, target)),
        }
    }

    /// Spawn every stage's workers and return the error stream. Does not
    /// wait for anything; use [`Pipeline::wait`] or drain the stream.
    pub fn run(&mut self) -> Result<ErrorStream, PipelineError> {
        let (source, target) = self.validate()?;
        let _ = self.started.set(Instant::now());

        let (errors_tx, errors_rx) = async_channel::unbounded::<ErrorRecord>();
        let mut upstream: Option<Receiver<ObjectDescriptor>> = None;
        let last = self.stages.len() - 1;

        for (index, spec) in self.stages.iter().enumerate() {
            let ctx = StepContext {
                source: source.clone(),
                target: target.clone(),
                stage: spec.info.name.clone(),
                control: self.control.clone(),
            };
            let (output_tx, output_rx) = if index == last {
                (None, None)
            } else {
                let (tx, rx) = async_channel::bounded(spec.buffer);
                (Some(tx), Some(rx))
            };

            match &spec.body {
                StageBody::Source(source_fn) => {
                    let Some(output) = output_tx else {
                        return Err(PipelineError::NoStages);
                    };
                    self.handles.push(tokio::spawn(run_source(
                        source_fn.clone(),
                        ctx,
                        output,
                        errors_tx.clone(),
                        spec.info.stats.clone(),
                    )));
                }
                StageBody::Step(step) => {
                    let Some(input) = upstream.take() else {
                        return Err(PipelineError::NoSource);
                    };
                    for _ in 0..spec.info.workers {
                        self.handles.push(tokio::spawn(run_step(
                            step.clone(),
                            ctx.clone(),
                            input.clone(),
                            output_tx.clone(),
                            errors_tx.clone(),
                            spec.info.stats.clone(),
                        )));
                    }
                    // Workers hold their own clones; dropping ours lets the
                    // output close when the last worker exits.
                    drop(output_tx);
                }
            }

            debug!(stage = %spec.info.name, workers = spec.info.workers, buffer = spec.buffer, "stage started");
            upstream = output_rx;
        }

        Ok(errors_rx)
    }

    /// Wait for every worker of every stage to finish.
    pub async fn wait(&mut self) -> Result<(), PipelineError> {
        if self.started.get().is_none() {
            return Err(PipelineError::NotStarted);
        }
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "stage worker panicked");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::{
            error::ErrorKind,
            stage::{Disposition, Emitter},
        },
        services::memory_storage::MemoryStorage,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Numbers(usize);

    #[async_trait]
    impl SourceFn for Numbers {
        async fn produce(&self, _ctx: &StepContext, out: &Emitter) -> Result<(), ErrorRecord> {
            for n in 0..self.0 {
                if !out.emit(ObjectDescriptor::new(n.to_string())).await {
                    break;
                }
            }
            Ok(())
        }
    }

    /// Drops odd keys, fails key "4", forwards the rest.
    struct EvenOnly;

    #[async_trait]
    impl StepFn for EvenOnly {
        async fn process(&self, ctx: &StepContext, object: ObjectDescriptor) -> Disposition {
            let n: usize = object.key.parse().unwrap_or_default();
            if n == 4 {
                Disposition::Fail(ErrorRecord::new(
                    ctx.stage.clone(),
                    ErrorKind::ObjectError { object },
                    "four",
                ))
            } else if n % 2 == 0 {
                Disposition::Forward(object)
            } else {
                Disposition::Drop
            }
        }
    }

    #[derive(Default)]
    struct Count(AtomicUsize);

    #[async_trait]
    impl StepFn for Count {
        async fn process(&self, _ctx: &StepContext, object: ObjectDescriptor) -> Disposition {
            self.0.fetch_add(1, Ordering::SeqCst);
            Disposition::Forward(object)
        }
    }

    fn pipeline_with(control: RunControl) -> Pipeline {
        let mut pipeline = Pipeline::new(control);
        pipeline
            .set_source(Arc::new(MemoryStorage::new("src")))
            .set_target(Arc::new(MemoryStorage::new("dst")));
        pipeline
    }

    #[tokio::test]
    async fn stages_cascade_to_completion() {
        let counter = Arc::new(Count::default());
        let mut pipeline = pipeline_with(RunControl::new());
        pipeline
            .add_source("numbers", Arc::new(Numbers(10)), 2)
            .add_stage("even", Arc::new(EvenOnly), 4, 2)
            .add_stage("count", counter.clone(), 1, 1);

        let errors = pipeline.run().unwrap();
        let mut records = Vec::new();
        while let Ok(record) = errors.recv().await {
            records.push(record);
        }
        pipeline.wait().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, "even");
        assert_eq!(counter.0.load(Ordering::SeqCst), 4);

        let snapshot = pipeline.stats_snapshot();
        let even = snapshot.get("even").unwrap();
        assert_eq!(even.counters.items_in, 10);
        assert_eq!(even.counters.items_out, 4);
        assert_eq!(even.counters.errors, 1);
        assert_eq!(snapshot.get("count").unwrap().counters.items_out, 4);
    }

    #[tokio::test]
    async fn rejects_misconfigured_pipelines() {
        let mut pipeline = Pipeline::new(RunControl::new());
        pipeline.add_source("numbers", Arc::new(Numbers(1)), 1);
        assert_eq!(pipeline.run().unwrap_err(), PipelineError::MissingSource);

        let mut pipeline = pipeline_with(RunControl::new());
        pipeline.add_source("numbers", Arc::new(Numbers(1)), 1);
        assert_eq!(pipeline.run().unwrap_err(), PipelineError::NoStages);

        let mut pipeline = pipeline_with(RunControl::new());
        pipeline.add_stage("even", Arc::new(EvenOnly), 1, 1);
        assert_eq!(pipeline.run().unwrap_err(), PipelineError::NoSource);

        let mut pipeline = pipeline_with(RunControl::new());
        pipeline
            .add_source("numbers", Arc::new(Numbers(1)), 1)
            .add_stage("count", Arc::new(Count::default()), 1, 1);
        let _errors = pipeline.run().unwrap();
        assert_eq!(pipeline.run().unwrap_err(), PipelineError::AlreadyStarted);
        pipeline.wait().await.unwrap();
    }

    #[tokio::test]
    async fn drained_source_stops_emitting() {
        let control = RunControl::new();
        control.drain();
        let counter = Arc::new(Count::default());
        let mut pipeline = pipeline_with(control);
        pipeline
            .add_source("numbers", Arc::new(Numbers(100)), 1)
            .add_stage("count", counter.clone(), 1, 1);

        let errors = pipeline.run().unwrap();
        while errors.recv().await.is_ok() {}
        pipeline.wait().await.unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        assert!(pipeline.control().was_cut_short());
    }

    #[tokio::test]
    async fn drain_after_completion_is_not_a_cut() {
        let control = RunControl::new();
        let counter = Arc::new(Count::default());
        let mut pipeline = pipeline_with(control.clone());
        pipeline
            .add_source("numbers", Arc::new(Numbers(5)), 8)
            .add_stage("count", counter.clone(), 2, 8);

        let errors = pipeline.run().unwrap();
        while errors.recv().await.is_ok() {}
        pipeline.wait().await.unwrap();
        control.drain();

        assert_eq!(counter.0.load(Ordering::SeqCst), 5);
        assert!(!control.was_cut_short());
    }

    #[test]
    fn child_control_follows_parent() {
        let parent = RunControl::new();
        let child = parent.child();
        child.abort();
        assert!(!parent.is_aborted());

        parent.drain();
        assert!(child.is_draining());

        child.note_cut_short();
        assert!(!parent.was_cut_short());
    }
}
