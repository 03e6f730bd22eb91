//! JSON-over-HTTP polling adapter.
//!
//! - `GET {base}/updates?offset=&timeout=` → `{"updates": [...], "next_offset": n}`
//! - `GET {base}/history?chat_id=&before=&limit=` → `{"events": [...], "end_of_history": bool}`

use async_trait::async_trait;
use ingest_core::{Error, PartitionId, Result, SourceErrorCode};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HttpSourceConfig;
use crate::source::{EventSource, HistoryPage, LiveBatch};
use crate::wire::decode_all;

#[derive(Debug, Deserialize)]
struct UpdatesEnvelope {
    #[serde(default)]
    updates: Vec<serde_json::Value>,
    #[serde(default)]
    next_offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HistoryEnvelope {
    #[serde(default)]
    events: Vec<serde_json::Value>,
    #[serde(default)]
    end_of_history: bool,
}

/// Polls a JSON HTTP API.
#[derive(Clone)]
pub struct HttpSource {
    http_client: reqwest::Client,
    base_url: String,
    config: HttpSourceConfig,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs + config.long_poll_secs);
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(config.request_timeout_secs.min(10)))
            .user_agent(concat!("chatlog-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, ?query, "Calling event source");

        let mut request = self.http_client.get(&url).query(query);
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, path, "Event source returned error");
            return Err(map_status(status, &body));
        }

        response.json::<T>().await.map_err(|e| {
            Error::source(
                SourceErrorCode::Rejected,
                format!("undecodable {} envelope: {}", path, e),
            )
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::source(SourceErrorCode::Timeout, format!("request timed out: {}", e))
    } else if e.is_connect() || e.is_request() {
        Error::source(SourceErrorCode::Unavailable, format!("source unreachable: {}", e))
    } else if e.is_decode() || e.is_body() {
        Error::source(SourceErrorCode::Unavailable, format!("response interrupted: {}", e))
    } else {
        Error::source(SourceErrorCode::Unavailable, e.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> Error {
    let code = if status == StatusCode::TOO_MANY_REQUESTS {
        SourceErrorCode::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        SourceErrorCode::Unavailable
    } else {
        SourceErrorCode::Rejected
    };
    Error::source(code, format!("source returned {}: {}", status, body))
}

#[async_trait]
impl EventSource for HttpSource {
    async fn poll_live(&self, offset: Option<i64>) -> Result<LiveBatch> {
        let mut query = vec![("timeout", self.config.long_poll_secs.to_string())];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        let envelope: UpdatesEnvelope = self.get_json("updates", &query).await?;
        Ok(LiveBatch {
            items: decode_all(envelope.updates),
            next_offset: envelope.next_offset,
        })
    }

    async fn fetch_history(
        &self,
        partition: PartitionId,
        before: Option<i64>,
        limit: usize,
    ) -> Result<HistoryPage> {
        let mut query = vec![
            ("chat_id", partition.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }

        let envelope: HistoryEnvelope = self.get_json("history", &query).await?;
        Ok(HistoryPage {
            events: decode_all(envelope.events),
            end_of_history: envelope.end_of_history,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}
