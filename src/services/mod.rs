//! Storage backends, bucket registry and job status shared with handlers.

pub mod fs_storage;
pub mod memory_storage;
pub mod registry;
pub mod s3_storage;
pub mod status_board;
pub mod storage;
