//! API Models
//!
//! Response bodies for the HTTP endpoints, documented with `utoipa`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

/// Liveness report for the relay service.
#[derive(Serialize, ToSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    /// The speech backend every session is relayed to.
    #[schema(example = "gateway")]
    pub provider: String,
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub started_at: DateTime<Utc>,
}
