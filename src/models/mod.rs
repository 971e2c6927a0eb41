//! Core data models for the bucket mirror.
//!
//! These entities describe buckets and the objects moving between them.
//! Catalog rows of the filesystem backend map to SQLite tables via
//! `sqlx::FromRow`; bucket identities serialize naturally via `serde`.

pub mod bucket;
pub mod metadata;
pub mod object;
