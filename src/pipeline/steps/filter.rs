//! Differential filter: drop objects whose destination copy is current.
//!
//! Stores that re-digest uploads (multipart vs single part, or a different
//! part size) report a different ETag for identical bytes. The annotation
//! written on the previous copy carries the source ETag across that gap.

use crate::{
    models::{metadata::ORIGINAL_ETAG, object::ObjectDescriptor},
    pipeline::stage::{Disposition, StepContext, StepFn},
};
use async_trait::async_trait;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferReason {
    /// The source reported no ETag; nothing to compare.
    NoSourceDigest,
    /// Destination metadata could not be fetched (absent or failing).
    DestinationUnavailable,
    DigestMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DigestMatch,
    AnnotatedDigestMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Transfer(TransferReason),
    Skip(SkipReason),
}

/// Decide whether `source_etag` still needs copying over `destination`.
/// `destination` is `None` when its metadata could not be fetched.
pub fn decide(source_etag: Option<&str>, destination: Option<&ObjectDescriptor>) -> Decision {
    let Some(source_etag) = source_etag else {
        return Decision::Transfer(TransferReason::NoSourceDigest);
    };
    let Some(destination) = destination else {
        return Decision::Transfer(TransferReason::DestinationUnavailable);
    };

    if destination.etag.as_deref() == Some(source_etag) {
        Decision::Skip(SkipReason::DigestMatch)
    } else if ORIGINAL_ETAG.read(&destination.metadata) == Some(source_etag) {
        Decision::Skip(SkipReason::AnnotatedDigestMatch)
    } else {
        Decision::Transfer(TransferReason::DigestMismatch)
    }
}

/// Stateless; safe to run with many workers.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilterUnmodified;

#[async_trait]
impl StepFn for FilterUnmodified {
    async fn process(&self, ctx: &StepContext, object: ObjectDescriptor) -> Disposition {
        let destination = match object.etag {
            None => None,
            Some(_) => match ctx
                .target
                .head_object(&object.key, object.version_id.as_deref())
                .await
            {
                Ok(head) => Some(head),
                Err(err) => {
                    trace!(key = %object.key, error = %err, "destination head failed");
                    None
                }
            },
        };

        match decide(object.etag.as_deref(), destination.as_ref()) {
            Decision::Skip(reason) => {
                debug!(key = %object.key, ?reason, "destination is current");
                Disposition::Drop
            }
            Decision::Transfer(reason) => {
                trace!(key = %object.key, ?reason, "transferring");
                Disposition::Forward(object)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::Metadata;
    use proptest::prelude::*;

    fn destination(etag: Option<&str>, annotated: Option<&str>) -> ObjectDescriptor {
        let mut metadata = Metadata::new();
        if let Some(annotated) = annotated {
            ORIGINAL_ETAG.write(&mut metadata, annotated);
        }
        ObjectDescriptor {
            etag: etag.map(str::to_string),
            metadata,
            ..ObjectDescriptor::new("k")
        }
    }

    #[test]
    fn decision_table() {
        let dst = destination(Some("\"md5\""), Some("\"multi-2\""));

        assert_eq!(
            decide(Some("\"md5\""), Some(&dst)),
            Decision::Skip(SkipReason::DigestMatch)
        );
        assert_eq!(
            decide(Some("\"multi-2\""), Some(&dst)),
            Decision::Skip(SkipReason::AnnotatedDigestMatch)
        );
        assert_eq!(
            decide(Some("\"other\""), Some(&dst)),
            Decision::Transfer(TransferReason::DigestMismatch)
        );
        assert_eq!(
            decide(Some("\"md5\""), None),
            Decision::Transfer(TransferReason::DestinationUnavailable)
        );
        assert_eq!(
            decide(None, Some(&dst)),
            Decision::Transfer(TransferReason::NoSourceDigest)
        );
    }

    proptest! {
        #[test]
        fn skips_exactly_when_a_digest_matches(
            source in "[a-f0-9]{1,8}",
            raw in proptest::option::of("[a-f0-9]{1,8}"),
            annotated in proptest::option::of("[a-f0-9]{1,8}"),
        ) {
            let dst = destination(raw.as_deref(), annotated.as_deref());
            let decision = decide(Some(source.as_str()), Some(&dst));

            let matches = raw.as_deref() == Some(source.as_str())
                || annotated.as_deref() == Some(source.as_str());
            prop_assert_eq!(matches!(decision, Decision::Skip(_)), matches);
            if raw.as_deref() == Some(source.as_str()) {
                prop_assert_eq!(decision, Decision::Skip(SkipReason::DigestMatch));
            }
        }

        #[test]
        fn missing_source_digest_always_transfers(
            raw in proptest::option::of("[a-f0-9]{1,8}"),
        ) {
            let dst = destination(raw.as_deref(), raw.as_deref());
            prop_assert_eq!(
                decide(None, Some(&dst)),
                Decision::Transfer(TransferReason::NoSourceDigest)
            );
        }
    }
}
