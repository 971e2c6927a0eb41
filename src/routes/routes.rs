//! Routes of the optional status server.
//!
//! - `GET /healthz`: liveness
//! - `GET /readyz`: backup job readiness
//! - `GET /stats`: live stage counters and finished pair summaries

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        stats_handlers::stats,
    },
    services::status_board::StatusBoard,
};
use axum::{Router, routing::get};

/// Build the status router. Handlers share the job's `StatusBoard`.
pub fn routes() -> Router<StatusBoard> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/stats", get(stats))
}
