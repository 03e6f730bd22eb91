//! Mock implementations for testing.

use async_trait::async_trait;
use ingest_core::{Error, Event, PartitionId, Result, SourceErrorCode};
use parking_lot::Mutex;
use source::{EventSource, HistoryPage, LiveBatch, SourceItem};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// How long an idle live poll is held open.
const IDLE_POLL: Duration = Duration::from_millis(25);

/// Mock source that serves scripted live batches and in-memory history.
///
/// This implements the same `EventSource` trait as the real `HttpSource`,
/// so the coordinator runs its production code paths against it.
#[derive(Clone, Default)]
pub struct MockSource {
    /// Live batches served in order, one per poll.
    live: Arc<Mutex<VecDeque<Vec<SourceItem>>>>,
    /// Full history per partition.
    history: Arc<Mutex<BTreeMap<PartitionId, Vec<Event>>>>,
    /// Offsets passed to `poll_live`.
    offsets: Arc<Mutex<Vec<Option<i64>>>>,
    /// (partition, before) passed to `fetch_history`.
    history_calls: Arc<Mutex<Vec<(PartitionId, Option<i64>)>>>,
    /// Simulate failures if set.
    should_fail: Arc<Mutex<bool>>,
    /// Hold idle polls and history reads this long, like a slow upstream.
    latency: Arc<Mutex<Option<Duration>>>,
    next_offset: Arc<Mutex<i64>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one live batch.
    pub fn push_live(&self, items: Vec<SourceItem>) {
        self.live.lock().push_back(items);
    }

    /// Queue one live batch of well-formed events.
    pub fn push_live_events(&self, events: Vec<Event>) {
        self.push_live(events.into_iter().map(SourceItem::Event).collect());
    }

    /// Replace the history of a partition.
    pub fn set_history(&self, partition: PartitionId, events: Vec<Event>) {
        self.history.lock().insert(partition, events);
    }

    pub fn offsets(&self) -> Vec<Option<i64>> {
        self.offsets.lock().clone()
    }

    pub fn history_calls(&self) -> Vec<(PartitionId, Option<i64>)> {
        self.history_calls.lock().clone()
    }

    pub fn pending_live(&self) -> usize {
        self.live.lock().len()
    }

    /// Set failure mode for testing error handling.
    pub fn set_should_fail(&self, fail: bool) {
        *self.should_fail.lock() = fail;
    }

    /// Simulate a slow upstream: idle long polls and history reads take `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    fn check_failure(&self) -> Result<()> {
        if *self.should_fail.lock() {
            return Err(Error::source(
                SourceErrorCode::Unavailable,
                "Mock source failure",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EventSource for MockSource {
    async fn poll_live(&self, offset: Option<i64>) -> Result<LiveBatch> {
        self.offsets.lock().push(offset);
        self.check_failure()?;

        let next = self.live.lock().pop_front();
        match next {
            Some(items) => {
                let next_offset = {
                    let mut counter = self.next_offset.lock();
                    *counter += items.len() as i64;
                    *counter
                };
                Ok(LiveBatch {
                    items,
                    next_offset: Some(next_offset),
                })
            }
            None => {
                let hold = self.latency.lock().unwrap_or(IDLE_POLL);
                tokio::time::sleep(hold).await;
                Ok(LiveBatch::default())
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
        self.check_failure()?;
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let history = self.history.lock();
        let mut older: Vec<&Event> = history
            .get(&partition)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| before.map_or(true, |b| e.position < b))
                    .collect()
            })
            .unwrap_or_default();

        // Newest first, like chat history APIs.
        older.sort_by_key(|e| std::cmp::Reverse(e.position));
        let end_of_history = older.len() <= limit;
        older.truncate(limit);

        Ok(HistoryPage {
            events: older.into_iter().cloned().map(SourceItem::Event).collect(),
            end_of_history,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[tokio::test]
    async fn test_mock_source_pages_history_newest_first() {
        let mock = MockSource::new();
        mock.set_history(1, fixtures::messages(1, 1..=5));

        let page = mock.fetch_history(1, None, 2).await.unwrap();
        let positions: Vec<i64> = page
            .events
            .into_iter()
            .filter_map(SourceItem::into_event)
            .map(|e| e.position)
            .collect();
        assert_eq!(positions, vec![5, 4]);
        assert!(!page.end_of_history);

        let page = mock.fetch_history(1, Some(2), 2).await.unwrap();
        assert_eq!(page.events.len(), 1);
        assert!(page.end_of_history);
        assert_eq!(mock.history_calls(), vec![(1, None), (1, Some(2))]);
    }

    #[tokio::test]
    async fn test_mock_source_failure_mode() {
        let mock = MockSource::new();
        mock.set_should_fail(true);

        let err = mock.poll_live(None).await.unwrap_err();
        assert!(err.is_transient());
        assert!(mock.fetch_history(1, None, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_source_advances_offset() {
        let mock = MockSource::new();
        mock.push_live_events(fixtures::messages(1, 1..=3));

        let batch = mock.poll_live(None).await.unwrap();
        assert_eq!(batch.items.len(), 3);
        assert_eq!(batch.next_offset, Some(3));

        let idle = mock.poll_live(Some(3)).await.unwrap();
        assert!(idle.items.is_empty());
        assert_eq!(idle.next_offset, None);
        assert_eq!(mock.offsets(), vec![None, Some(3)]);
    }
}
