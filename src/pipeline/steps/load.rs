use crate::{
    models::object::ObjectDescriptor,
    pipeline::{
        error::ErrorRecord,
        stage::{Disposition, StepContext, StepFn},
    },
};
use async_trait::async_trait;
use tracing::trace;

/// Fetches payload and authoritative metadata from the source.
///
/// The listed ETag is kept when the source omits one on GET, so the
/// annotation always records what the filter compared against.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadObject;

#[async_trait]
impl StepFn for LoadObject {
    async fn process(&self, ctx: &StepContext, object: ObjectDescriptor) -> Disposition {
        match ctx
            .source
            .get_object(&object.key, object.version_id.as_deref())
            .await
        {
            Ok(mut loaded) => {
                if loaded.etag.is_none() {
                    loaded.etag = object.etag;
                }
                if loaded.version_id.is_none() {
                    loaded.version_id = object.version_id;
                }
                trace!(key = %loaded.key, size = ?loaded.size, "loaded object");
                Disposition::Forward(loaded)
            }
            Err(err) => Disposition::Fail(ErrorRecord::from_load_failure(&ctx.stage, object, &err)),
        }
    }
}
