use crate::{
    models::{metadata::ORIGINAL_ETAG, object::ObjectDescriptor},
    pipeline::stage::{Disposition, StepContext, StepFn},
};
use async_trait::async_trait;

/// Stamps the source ETag into the reserved metadata field before upload.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnnotateEtag;

#[async_trait]
impl StepFn for AnnotateEtag {
    async fn process(&self, _ctx: &StepContext, mut object: ObjectDescriptor) -> Disposition {
        match object.etag.clone() {
            Some(etag) => ORIGINAL_ETAG.write(&mut object.metadata, &etag),
            // Without a digest, a stale annotation from the source would lie.
            None => {
                object.metadata.remove(ORIGINAL_ETAG.key);
            }
        }
        Disposition::Forward(object)
    }
}
