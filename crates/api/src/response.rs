//! Response bodies for the reporting surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use ingest_core::{Checkpoint, PartitionId};
use pipeline::BackfillProgress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use store::StoreStatistics;
use telemetry::{ComponentHealthReport, MetricsSnapshot};

/// GET / body.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexResponse {
    pub name: String,
    pub version: String,
    pub status: String,
    pub endpoints: BTreeMap<String, String>,
}

/// GET /health body.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub storage_reachable: bool,
    pub components: Vec<ComponentHealthReport>,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub flush_stale: bool,
    pub pending_events: usize,
    pub backfills_paused: usize,
}

/// GET /stats body.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub uptime_secs: i64,
    pub started_at: DateTime<Utc>,
    pub pipeline: MetricsSnapshot,
    pub pending_events: usize,
    pub live_offset: Option<i64>,
    /// Row counts, cached for five minutes.
    pub storage: StoreStatistics,
}

/// GET /backfill body.
#[derive(Debug, Serialize)]
pub struct BackfillResponse {
    pub in_progress: Vec<PartitionId>,
    pub partitions: Vec<BackfillProgress>,
    pub checkpoints: Vec<Checkpoint>,
}

/// Error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Handler error carrying a status and a coded body.
pub struct ApiError {
    pub status: StatusCode,
    pub response: ErrorResponse,
}

impl ApiError {
    pub fn unavailable(msg: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            response: ErrorResponse {
                error: msg.into(),
                code: code.map(str::to_string),
            },
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            response: ErrorResponse {
                error: msg.into(),
                code: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.response)).into_response()
    }
}

impl From<ingest_core::Error> for ApiError {
    fn from(err: ingest_core::Error) -> Self {
        match &err {
            ingest_core::Error::Storage { code, message, .. } => {
                ApiError::unavailable(message.clone(), Some(*code))
            }
            _ => ApiError::internal(err.to_string()),
        }
    }
}
