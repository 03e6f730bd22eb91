//! The event source contract.

use async_trait::async_trait;
use ingest_core::{Event, PartitionId, Result};
use serde::{Deserialize, Serialize};

/// One decoded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum SourceItem {
    Event(Event),
    /// A payload that could not be decoded. Reported, never silently dropped.
    Malformed {
        reason: String,
        raw: serde_json::Value,
    },
}

impl SourceItem {
    pub fn into_event(self) -> Option<Event> {
        match self {
            Self::Event(event) => Some(event),
            Self::Malformed { .. } => None,
        }
    }
}

/// One long-poll response from the live feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveBatch {
    pub items: Vec<SourceItem>,
    /// Offset to pass to the next poll; `None` keeps the current one.
    pub next_offset: Option<i64>,
}

/// One page of history, newest first or oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    pub events: Vec<SourceItem>,
    /// The source has nothing older than this page.
    pub end_of_history: bool,
}

impl HistoryPage {
    /// An empty page means the same as an explicit end of history.
    pub fn is_exhausted(&self) -> bool {
        self.end_of_history || self.events.is_empty()
    }
}

/// A provider of live and historical chat events.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Long-poll for new events starting at `offset`.
    async fn poll_live(&self, offset: Option<i64>) -> Result<LiveBatch>;

    /// Up to `limit` events of `partition` strictly older than `before`.
    ///
    /// `before = None` reads from the newest event.
    async fn fetch_history(
        &self,
        partition: PartitionId,
        before: Option<i64>,
        limit: usize,
    ) -> Result<HistoryPage>;

    /// Name used in logs and health reports.
    fn name(&self) -> &str {
        "source"
    }
}
