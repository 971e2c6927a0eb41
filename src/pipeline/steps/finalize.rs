use crate::{
    models::object::ObjectDescriptor,
    pipeline::stage::{Disposition, StepContext, StepFn},
};
use async_trait::async_trait;
use tracing::trace;

/// Terminal stage: releases the payload. Completion is counted by the
/// stage's `items_out`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Finalize;

#[async_trait]
impl StepFn for Finalize {
    async fn process(&self, _ctx: &StepContext, mut object: ObjectDescriptor) -> Disposition {
        object.payload = None;
        trace!(key = %object.key, "object complete");
        Disposition::Forward(object)
    }
}
