//! The stage functions of a mirror run, in pipeline order.

pub mod annotate;
pub mod filter;
pub mod finalize;
pub mod list;
pub mod load;
pub mod upload;

pub const LIST_SOURCE: &str = "list-source";
pub const REPLAY_RETRY_SET: &str = "replay-retry-set";
pub const FILTER_UNMODIFIED: &str = "filter-unmodified";
pub const LOAD_OBJECT: &str = "load-object";
pub const ANNOTATE_ETAG: &str = "annotate-etag";
pub const UPLOAD_OBJECT: &str = "upload-object";
pub const FINALIZE: &str = "finalize";
