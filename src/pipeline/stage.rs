//! Stage functions and the worker loops that drive them.

use crate::{models::object::ObjectDescriptor, services::storage::Storage};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{RunControl, error::ErrorRecord, stats::StageStats};

/// What a step decided for one object.
#[derive(Debug)]
pub enum Disposition {
    /// Hand the object to the next stage.
    Forward(ObjectDescriptor),
    /// Done with the object; nothing to report.
    Drop,
    /// Report the failure and drop the object.
    Fail(ErrorRecord),
}

/// Everything a stage function may touch.
#[derive(Clone)]
pub struct StepContext {
    pub source: Arc<dyn Storage>,
    pub target: Arc<dyn Storage>,
    /// Name of the stage running the function.
    pub stage: String,
    pub control: RunControl,
}

/// Per-object transformation. Workers of one stage share a single instance.
#[async_trait]
pub trait StepFn: Send + Sync {
    async fn process(&self, ctx: &StepContext, object: ObjectDescriptor) -> Disposition;
}

/// Head of the pipeline: produces objects instead of consuming them.
#[async_trait]
pub trait SourceFn: Send + Sync {
    /// Emit objects until exhausted or told to stop. An `Err` is reported on
    /// the error channel while the output is still open; a fatal one aborts
    /// the run first, so nothing already emitted reaches the target.
    async fn produce(&self, ctx: &StepContext, out: &Emitter) -> Result<(), ErrorRecord>;
}

/// Output side of a source stage.
pub struct Emitter {
    output: Sender<ObjectDescriptor>,
    stats: Arc<StageStats>,
    control: RunControl,
}

impl Emitter {
    pub(crate) fn new(
        output: Sender<ObjectDescriptor>,
        stats: Arc<StageStats>,
        control: RunControl,
    ) -> Self {
        Self {
            output,
            stats,
            control,
        }
    }

    /// True once the run is draining or aborted.
    pub fn should_stop(&self) -> bool {
        let stop = self.control.is_draining() || self.control.is_aborted();
        if stop {
            self.control.note_cut_short();
        }
        stop
    }

    /// Send one object downstream. Returns `false` when the source should
    /// stop: the run is draining or aborted, or every consumer is gone.
    pub async fn emit(&self, object: ObjectDescriptor) -> bool {
        if self.should_stop() {
            return false;
        }
        self.stats.record_in();

        let sent = tokio::select! {
            biased;
            _ = self.control.aborted() => {
                self.control.note_cut_short();
                false
            }
            _ = self.control.drained() => {
                self.control.note_cut_short();
                false
            }
            sent = self.output.send(object) => sent.is_ok(),
        };
        if sent {
            self.stats.record_out();
        }
        sent
    }
}

pub(crate) async fn run_source(
    source: Arc<dyn SourceFn>,
    ctx: StepContext,
    output: Sender<ObjectDescriptor>,
    errors: Sender<ErrorRecord>,
    stats: Arc<StageStats>,
) {
    let emitter = Emitter::new(output, stats.clone(), ctx.control.clone());
    let result = tokio::select! {
        biased;
        _ = ctx.control.aborted() => {
            ctx.control.note_cut_short();
            Ok(())
        }
        result = source.produce(&ctx, &emitter) => result,
    };

    if let Err(record) = result {
        report(&ctx, &errors, &stats, record).await;
    }
    drop(emitter);
    debug!(stage = %ctx.stage, "source finished");
}

pub(crate) async fn run_step(
    step: Arc<dyn StepFn>,
    ctx: StepContext,
    input: Receiver<ObjectDescriptor>,
    output: Option<Sender<ObjectDescriptor>>,
    errors: Sender<ErrorRecord>,
    stats: Arc<StageStats>,
) {
    loop {
        let object = tokio::select! {
            biased;
            _ = ctx.control.aborted() => {
                ctx.control.note_cut_short();
                break;
            }
            received = input.recv() => match received {
                Ok(object) => object,
                Err(_) => break,
            },
        };
        stats.record_in();

        let disposition = tokio::select! {
            biased;
            _ = ctx.control.aborted() => {
                ctx.control.note_cut_short();
                break;
            }
            disposition = step.process(&ctx, object) => disposition,
        };

        match disposition {
            Disposition::Forward(object) => match &output {
                Some(next) => {
                    let sent = tokio::select! {
                        biased;
                        _ = ctx.control.aborted() => {
                            ctx.control.note_cut_short();
                            break;
                        }
                        sent = next.send(object) => sent,
                    };
                    if sent.is_err() {
                        warn!(stage = %ctx.stage, "downstream stage closed early");
                        break;
                    }
                    stats.record_out();
                }
                None => stats.record_out(),
            },
            Disposition::Drop => {}
            Disposition::Fail(record) => report(&ctx, &errors, &stats, record).await,
        }
    }
}

/// Put `record` on the error channel. A fatal record aborts the run before
/// it is sent, so no stage picks up more work in the meantime.
async fn report(
    ctx: &StepContext,
    errors: &Sender<ErrorRecord>,
    stats: &StageStats,
    record: ErrorRecord,
) {
    stats.record_error();
    if record.is_fatal() {
        ctx.control.abort();
    }
    let _ = errors.send(record).await;
}
