//! Scripted source and event builders for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ingest_core::{
    ChatInfo, ChatKind, Error, Event, EventId, EventKind, MessageType, PartitionId, Result,
    UserInfo,
};
use parking_lot::Mutex;
use source::{EventSource, HistoryPage, LiveBatch, SourceItem};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

pub fn message_at(partition: PartitionId, position: i64, occurred_at: DateTime<Utc>) -> Event {
    Event {
        id: EventId::Message(position),
        partition,
        position,
        occurred_at,
        kind: EventKind::Message(MessageType::Text),
        sender: Some(UserInfo::new(500 + position % 4, "member")),
        chat: ChatInfo::new(partition, ChatKind::Supergroup).with_title("test chat"),
        payload: serde_json::json!({"text": format!("message {}", position)}),
        is_backfilled: false,
    }
}

/// A message whose age in minutes decreases with its position.
pub fn message(partition: PartitionId, position: i64) -> Event {
    message_at(
        partition,
        position,
        Utc::now() - ChronoDuration::minutes(10_000 - position),
    )
}

pub fn history(partition: PartitionId, positions: impl IntoIterator<Item = i64>) -> Vec<Event> {
    positions.into_iter().map(|p| message(partition, p)).collect()
}

#[derive(Default)]
pub struct ScriptedSource {
    history: Mutex<BTreeMap<PartitionId, Vec<Event>>>,
    history_failures: Mutex<VecDeque<Error>>,
    history_calls: Mutex<Vec<(PartitionId, Option<i64>)>>,
    live: Mutex<VecDeque<Result<LiveBatch>>>,
    /// Include the event at `before` in pages, like a sloppy source.
    overlap: bool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn overlapping() -> Self {
        Self {
            overlap: true,
            ..Self::default()
        }
    }

    pub fn with_history(self, partition: PartitionId, events: Vec<Event>) -> Self {
        self.history.lock().insert(partition, events);
        self
    }

    pub fn fail_history(&self, err: Error) {
        self.history_failures.lock().push_back(err);
    }

    pub fn push_live(&self, batch: Result<LiveBatch>) {
        self.live.lock().push_back(batch);
    }

    pub fn history_calls(&self) -> Vec<(PartitionId, Option<i64>)> {
        self.history_calls.lock().clone()
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn poll_live(&self, offset: Option<i64>) -> Result<LiveBatch> {
        let next = self.live.lock().pop_front();
        match next {
            Some(batch) => batch,
            None => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(LiveBatch {
                    items: Vec::new(),
                    next_offset: offset,
                })
            }
        }
    }

    async fn fetch_history(
        &self,
        partition: PartitionId,
        before: Option<i64>,
        limit: usize,
    ) -> Result<HistoryPage> {
        self.history_calls.lock().push((partition, before));
        if let Some(err) = self.history_failures.lock().pop_front() {
            return Err(err);
        }

        let history = self.history.lock();
        let older: Vec<&Event> = history
            .get(&partition)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| match before {
                        Some(b) if self.overlap => e.position <= b,
                        Some(b) => e.position < b,
                        None => true,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut page: Vec<&Event> = older.clone();
        page.sort_by_key(|e| std::cmp::Reverse(e.position));
        page.truncate(limit);
        let end_of_history = page.len() == older.len();
        // Oldest first, the way chat APIs page.
        page.reverse();

        Ok(HistoryPage {
            events: page.into_iter().cloned().map(SourceItem::Event).collect(),
            end_of_history,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
