use crate::{
    models::object::ObjectDescriptor,
    pipeline::{
        error::ErrorRecord,
        stage::{Disposition, StepContext, StepFn},
    },
};
use async_trait::async_trait;
use tracing::debug;

/// Writes payload and annotated metadata to the destination, same key.
#[derive(Debug, Default, Clone, Copy)]
pub struct UploadObject;

#[async_trait]
impl StepFn for UploadObject {
    async fn process(&self, ctx: &StepContext, object: ObjectDescriptor) -> Disposition {
        match ctx.target.put_object(&object).await {
            Ok(()) => {
                debug!(key = %object.key, size = ?object.size, "uploaded");
                Disposition::Forward(object)
            }
            Err(err) => {
                Disposition::Fail(ErrorRecord::from_upload_failure(&ctx.stage, object, &err))
            }
        }
    }
}
