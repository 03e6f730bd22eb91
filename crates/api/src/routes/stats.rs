//! Service index, counters and backfill state.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::response::{ApiError, BackfillResponse, IndexResponse, StatsResponse};
use crate::state::AppState;

const SERVICE_NAME: &str = "chatlog-ingest";

/// GET / - Service index.
pub async fn index_handler() -> Json<IndexResponse> {
    let endpoints = [
        ("health", "/health"),
        ("ready", "/health/ready"),
        ("live", "/health/live"),
        ("stats", "/stats"),
        ("backfill", "/backfill"),
    ]
    .into_iter()
    .map(|(name, path)| (name.to_string(), path.to_string()))
    .collect::<BTreeMap<_, _>>();

    Json(IndexResponse {
        name: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "running".to_string(),
        endpoints,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    /// Bypass the statistics cache
    #[serde(default)]
    pub refresh: bool,
}

/// GET /stats - Pipeline counters and storage row counts.
pub async fn stats_handler(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    if query.refresh {
        state.stats.invalidate().await;
    }
    let storage = state.stats.get().await?;
    let report = state.coordinator.report();

    Ok(Json(StatsResponse {
        uptime_secs: report.uptime_secs,
        started_at: report.started_at,
        pipeline: report.metrics,
        pending_events: report.pending_events,
        live_offset: report.live_offset,
        storage,
    }))
}

/// GET /backfill - Per-partition walk progress and cursors.
pub async fn backfill_handler(State(state): State<AppState>) -> Json<BackfillResponse> {
    let report = state.coordinator.report();

    Json(BackfillResponse {
        in_progress: state.coordinator.checkpoints().in_progress(),
        partitions: report.backfill,
        checkpoints: report.checkpoints,
    })
}
