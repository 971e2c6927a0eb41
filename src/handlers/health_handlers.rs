//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> 200 while the backup runs or after it succeeded,
//!   503 once it failed

use crate::services::status_board::{JobPhase, StatusBoard};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

/// `GET /healthz`
///
/// Liveness probe. Always 200 OK with a plain JSON body.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
pub async fn readyz(State(board): State<StatusBoard>) -> impl IntoResponse {
    let phase = board.phase();
    let status = match phase {
        JobPhase::Failed => StatusCode::SERVICE_UNAVAILABLE,
        JobPhase::Starting | JobPhase::Running | JobPhase::Succeeded => StatusCode::OK,
    };
    let body = ReadyResponse {
        status: if status.is_success() {
            "ok".into()
        } else {
            "error".into()
        },
        phase,
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    phase: JobPhase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readyz_turns_unavailable_after_failure() {
        let board = StatusBoard::new();
        let ok = readyz(State(board.clone())).await.into_response();
        assert_eq!(ok.status(), StatusCode::OK);

        board.set_phase(JobPhase::Failed);
        let failed = readyz(State(board)).await.into_response();
        assert_eq!(failed.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
