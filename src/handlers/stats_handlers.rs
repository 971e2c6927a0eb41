use crate::{
    errors::AppError,
    services::status_board::{StatusBoard, StatusView},
};
use axum::{Json, extract::State};

/// `GET /stats`
///
/// Live stage counters of the current pass plus summaries of finished
/// pairs. 404 until the first pass has started.
pub async fn stats(State(board): State<StatusBoard>) -> Result<Json<StatusView>, AppError> {
    let view = board.view();
    if view.is_empty() {
        return Err(AppError::not_found("no mirror run has started yet"));
    }
    Ok(Json(view))
}
