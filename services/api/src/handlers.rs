//! Axum Handlers for the REST API
//!
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{extract::State, response::Json};
use std::sync::Arc;

use crate::{models::HealthResponse, state::AppState};

/// Report service liveness and connection counters.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "The relay is accepting connections", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        provider: state.config.provider.as_str().to_string(),
        active_sessions: state.stats.active_sessions(),
        total_sessions: state.stats.total_sessions(),
        started_at: state.started_at,
    })
}
