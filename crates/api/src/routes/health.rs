//! Health check endpoints.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use pipeline::BackfillPhase;
use std::time::Duration;

use crate::response::HealthResponse;
use crate::state::AppState;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// GET /health - Full health check.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = state.coordinator.report();
    let storage_reachable = matches!(
        tokio::time::timeout(PING_TIMEOUT, state.store.ping()).await,
        Ok(Ok(()))
    );

    Json(HealthResponse {
        status: format!("{:?}", report.health.status).to_lowercase(),
        timestamp: Utc::now(),
        storage_reachable,
        components: report.health.components,
        last_flush_at: report.last_flush_at,
        flush_stale: report.flush_stale,
        pending_events: report.pending_events,
        backfills_paused: report
            .backfill
            .iter()
            .filter(|p| matches!(p.phase, BackfillPhase::Paused | BackfillPhase::Aborted))
            .count(),
    })
}

/// GET /health/ready - Storage is accepting commits.
pub async fn ready_handler(State(state): State<AppState>) -> StatusCode {
    if state.coordinator.health().is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health/live - Liveness probe (service is running).
pub async fn live_handler(State(state): State<AppState>) -> StatusCode {
    if state.coordinator.health().is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
