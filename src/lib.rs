//! Incremental bucket-to-bucket mirroring.
//!
//! The core is [`pipeline`]: a staged, concurrent engine that lists a source
//! bucket, skips objects whose destination copy is current, copies the rest
//! and classifies failures into a retry set. [`mirror`] runs it in bounded
//! retry passes for one bucket pair; [`backup`] drives every pair a
//! [`services::registry::ClaimRegistry`] knows about.

pub mod backup;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod mirror;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
