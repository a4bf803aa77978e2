//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the relay WebSocket endpoint, health check, and OpenAPI documentation.

use crate::{handlers, models::HealthResponse, state::AppState, ws::ws_handler};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::health),
    components(schemas(HealthResponse)),
    tags(
        (name = "Transcription Relay", description = "Streams client audio to a speech backend and relays transcriptions")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let relay_path = app_state.config.relay_path.clone();

    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route(&relay_path, get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
