//! End-to-end tests for live ingestion and backfill.
//!
//! These run the real coordinator against MockSource and the in-memory store.

use chrono::{Duration as ChronoDuration, Utc};
use ingest_core::{CheckpointAdvance, CheckpointKey, EventId};
use integration_tests::{fixtures, mocks::MockSource, setup::TestContext};
use pipeline::{BackfillOutcome, CompletionReason};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{EventStore, MemoryStore};

/// Live events are committed and the live checkpoint follows them
#[tokio::test]
async fn test_live_events_are_committed() {
    let ctx = TestContext::new();
    ctx.source.push_live_events(fixtures::messages(1, 1..=3));
    ctx.start().await;

    ctx.wait_for_events(3).await;

    let live = ctx
        .store
        .get_checkpoint(CheckpointKey::live(1))
        .await
        .unwrap()
        .expect("live checkpoint should exist");
    assert_eq!(live.last_position, Some(3));
    assert_eq!(live.total_processed, 3);

    assert!(ctx.store.chat(1).is_some(), "chat descriptor should be stored");
    assert!(ctx.store.user(1001).is_some(), "sender descriptor should be stored");

    ctx.shutdown().await;
    assert!(
        ctx.source.offsets().contains(&Some(3)),
        "next poll should use the returned offset"
    );
}

/// An event seen by both backfill and the live feed is stored once
#[tokio::test]
async fn test_backfill_and_live_duplicate_is_stored_once() {
    let mut config = fixtures::pipeline_config();
    config.backfill.partitions = vec![1];
    let ctx = TestContext::with_config(config);
    ctx.source.set_history(1, fixtures::messages(1, 1..=8));
    ctx.start().await;

    let outcomes = ctx.coordinator.run_backfill().await.unwrap();
    assert_eq!(
        outcomes,
        vec![(1, BackfillOutcome::Completed(CompletionReason::SourceExhausted))]
    );
    assert_eq!(ctx.store.event_count(), 8);

    // The live feed catches up and redelivers the newest message.
    ctx.source
        .push_live_events(vec![fixtures::message(1, 8), fixtures::message(1, 9)]);
    ctx.wait_for_events(9).await;
    ctx.shutdown().await;

    assert_eq!(ctx.store.event_count(), 9);
    let first_seen = ctx.store.get_event(1, EventId::Message(8)).unwrap();
    assert!(
        first_seen.is_backfilled,
        "the first stored copy keeps its provenance"
    );
    let live_only = ctx.store.get_event(1, EventId::Message(9)).unwrap();
    assert!(!live_only.is_backfilled);

    let backfill = ctx
        .store
        .get_checkpoint(CheckpointKey::backfill(1))
        .await
        .unwrap()
        .unwrap();
    assert!(backfill.backfill_completed());
    assert_eq!(backfill.last_position, Some(1));
}

/// An action delivered by both backfill and the live feed is stored once
#[tokio::test]
async fn test_backfill_and_live_duplicate_action_is_stored_once() {
    let mut config = fixtures::pipeline_config();
    config.backfill.partitions = vec![6];
    let ctx = TestContext::with_config(config);
    let mut history = fixtures::messages(6, 1..=3);
    history.push(fixtures::member_join(6, 4));
    ctx.source.set_history(6, history);
    ctx.start().await;

    ctx.coordinator.run_backfill().await.unwrap();
    assert_eq!(ctx.store.event_count(), 4);

    ctx.source.push_live_events(vec![
        fixtures::member_join(6, 4),
        fixtures::message(6, 5),
    ]);
    ctx.wait_for_events(5).await;
    ctx.shutdown().await;

    let actions: Vec<_> = ctx
        .store
        .events_in(6)
        .into_iter()
        .filter(|e| !e.is_message())
        .collect();
    assert_eq!(actions.len(), 1, "one row per action");
    assert!(actions[0].is_backfilled);
    assert_eq!(ctx.store.statistics().await.unwrap().total_actions, 1);
}

/// A restarted process resumes an interrupted backfill strictly below its cursor
#[tokio::test]
async fn test_backfill_resumes_from_checkpoint_after_restart() {
    let store = Arc::new(MemoryStore::new());
    store
        .advance_checkpoint(&CheckpointAdvance {
            key: CheckpointKey::backfill(1),
            position: 21,
            timestamp: None,
            delta_count: 10,
        })
        .await
        .unwrap();
    store.set_backfill_in_progress(1, true).await.unwrap();

    let source = MockSource::new();
    source.set_history(1, fixtures::messages(1, 1..=30));

    let ctx = TestContext::with_parts(fixtures::pipeline_config(), store, source);
    ctx.start().await;

    let outcomes = ctx.coordinator.run_backfill().await.unwrap();
    assert_eq!(
        outcomes,
        vec![(1, BackfillOutcome::Completed(CompletionReason::SourceExhausted))]
    );

    let calls = ctx.source.history_calls();
    assert_eq!(calls.first(), Some(&(1, Some(21))));
    assert_eq!(ctx.store.event_count(), 20);
    assert!(ctx.store.get_event(1, EventId::Message(21)).is_none());

    let checkpoint = ctx
        .store
        .get_checkpoint(CheckpointKey::backfill(1))
        .await
        .unwrap()
        .unwrap();
    assert!(checkpoint.backfill_completed());
    assert_eq!(checkpoint.total_processed, 30);

    ctx.shutdown().await;
}

/// A completed backfill is not walked again
#[tokio::test]
async fn test_completed_backfill_is_skipped() {
    let mut config = fixtures::pipeline_config();
    config.backfill.partitions = vec![1];
    let ctx = TestContext::with_config(config);
    ctx.source.set_history(1, fixtures::messages(1, 1..=4));
    ctx.start().await;

    ctx.coordinator.run_backfill().await.unwrap();
    let calls = ctx.source.history_calls().len();

    let outcomes = ctx.coordinator.run_backfill().await.unwrap();
    assert_eq!(outcomes, vec![(1, BackfillOutcome::Skipped)]);
    assert_eq!(ctx.source.history_calls().len(), calls);

    ctx.shutdown().await;
}

/// Backfill stops at the configured maximum age
#[tokio::test]
async fn test_backfill_stops_at_max_age() {
    let mut config = fixtures::pipeline_config();
    config.backfill.partitions = vec![1];
    config.backfill.max_age_days = Some(1);
    let ctx = TestContext::with_config(config);

    let now = Utc::now();
    let mut history: Vec<_> = (1..=5)
        .map(|p| fixtures::message_at(1, p, now - ChronoDuration::days(10)))
        .collect();
    history.extend((6..=10).map(|p| fixtures::message_at(1, p, now - ChronoDuration::hours(1))));
    ctx.source.set_history(1, history);
    ctx.start().await;

    let outcomes = ctx.coordinator.run_backfill().await.unwrap();
    assert_eq!(
        outcomes,
        vec![(1, BackfillOutcome::Completed(CompletionReason::MaxAgeReached))]
    );
    assert_eq!(ctx.store.event_count(), 5);
    assert!(ctx.store.get_event(1, EventId::Message(5)).is_none());

    ctx.shutdown().await;
}

/// Filtered and malformed payloads never reach storage
#[tokio::test]
async fn test_filtered_events_are_not_stored() {
    let mut config = fixtures::pipeline_config();
    config.filter.process_bot_messages = false;
    config.filter.ignored_chats = vec![2];
    let ctx = TestContext::with_config(config);

    ctx.source.push_live(vec![
        source::SourceItem::Event(fixtures::message(1, 1)),
        source::SourceItem::Event(fixtures::bot_message(1, 2)),
        source::SourceItem::Event(fixtures::message(2, 1)),
        fixtures::malformed("missing chat"),
        source::SourceItem::Event(fixtures::service_message(1, 3)),
    ]);
    ctx.start().await;

    ctx.wait_for_events(2).await;
    ctx.shutdown().await;

    assert_eq!(ctx.store.event_count(), 2);
    assert!(ctx.store.get_event(1, EventId::Message(2)).is_none());
    assert!(ctx.store.events_in(2).is_empty());

    let metrics = ctx.coordinator.metrics().snapshot();
    assert_eq!(metrics.events_received, 4);
    assert_eq!(metrics.events_accepted, 2);
    assert_eq!(metrics.events_rejected, 2);
    assert_eq!(metrics.events_skipped, 1);
}

/// Channel allow lists match usernames regardless of case and `@`
#[tokio::test]
async fn test_channel_allow_list() {
    let mut config = fixtures::pipeline_config();
    config.filter.allowed_channels = vec!["@news".to_string()];
    let ctx = TestContext::with_config(config);

    ctx.source.push_live_events(vec![
        fixtures::channel_post(3, 1, "News"),
        fixtures::channel_post(4, 1, "gossip"),
        fixtures::message(5, 1),
    ]);
    ctx.start().await;

    ctx.wait_for_events(2).await;
    ctx.shutdown().await;

    assert_eq!(ctx.store.events_in(3).len(), 1);
    assert!(ctx.store.events_in(4).is_empty());
    assert_eq!(ctx.store.events_in(5).len(), 1);
}

/// Shutdown commits what is still buffered
#[tokio::test]
async fn test_shutdown_flushes_pending_events() {
    let mut config = fixtures::pipeline_config();
    config.batch.max_size = 50;
    config.batch.flush_interval_secs = 3600;
    let ctx = TestContext::with_config(config);
    ctx.source.push_live_events(fixtures::messages(1, 1..=3));
    ctx.start().await;

    let buffer = ctx.coordinator.buffer().clone();
    integration_tests::setup::wait_until(std::time::Duration::from_secs(5), move || {
        let buffer = buffer.clone();
        async move { buffer.pending_len() == 3 }
    })
    .await;
    assert_eq!(ctx.store.event_count(), 0);

    let flushed = ctx.shutdown().await;
    assert_eq!(flushed, 3);
    assert_eq!(ctx.store.event_count(), 3);
}

/// Shutdown does not wait out a slow live poll before flushing
#[tokio::test]
async fn test_shutdown_interrupts_slow_live_poll() {
    let mut config = fixtures::pipeline_config();
    config.batch.max_size = 50;
    config.batch.flush_interval_secs = 3600;
    let ctx = TestContext::with_config(config);
    ctx.source.push_live_events(vec![fixtures::message(1, 1)]);
    ctx.source.set_latency(Duration::from_secs(25));
    ctx.start().await;

    let buffer = ctx.coordinator.buffer().clone();
    integration_tests::setup::wait_until(Duration::from_secs(5), move || {
        let buffer = buffer.clone();
        async move { buffer.pending_len() == 1 }
    })
    .await;

    let started = Instant::now();
    let flushed = tokio::time::timeout(Duration::from_secs(5), ctx.coordinator.shutdown())
        .await
        .expect("shutdown should not wait for the poll")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(flushed, 1);
    assert_eq!(ctx.store.event_count(), 1);
}

/// Shutdown interrupts a backfill waiting on a slow history read
#[tokio::test]
async fn test_shutdown_interrupts_slow_history_fetch() {
    let mut config = fixtures::pipeline_config();
    config.backfill.partitions = vec![2];
    let ctx = TestContext::with_config(config);
    ctx.source.set_history(2, fixtures::messages(2, 1..=5));
    ctx.source.set_latency(Duration::from_secs(25));
    ctx.start().await;

    let coordinator = ctx.coordinator.clone();
    let walk = tokio::spawn(async move { coordinator.run_backfill().await });

    let source = ctx.source.clone();
    integration_tests::setup::wait_until(Duration::from_secs(5), move || {
        let source = source.clone();
        async move { !source.history_calls().is_empty() }
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), ctx.coordinator.shutdown())
        .await
        .expect("shutdown should not wait for the history read")
        .unwrap();

    let outcomes = tokio::time::timeout(Duration::from_secs(5), walk)
        .await
        .expect("backfill should stop on shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(outcomes, vec![(2, BackfillOutcome::Cancelled)]);
    assert_eq!(ctx.store.event_count(), 0);
}

/// Retention deletes expired events and backfill stays inside the horizon
#[tokio::test]
async fn test_retention_sweep_and_backfill_horizon() {
    let now = Utc::now();
    let store = Arc::new(MemoryStore::new());
    store
        .commit_batch(&pipeline::build_batch(vec![
            fixtures::message_at(4, 1, now - ChronoDuration::days(60)),
            fixtures::message_at(4, 2, now - ChronoDuration::days(45)),
        ]))
        .await
        .unwrap();

    let source = MockSource::new();
    let mut history: Vec<_> = (3..=5)
        .map(|p| fixtures::message_at(8, p, now - ChronoDuration::days(40)))
        .collect();
    history.extend((6..=8).map(|p| fixtures::message_at(8, p, now - ChronoDuration::days(2))));
    source.set_history(8, history);

    let mut config = fixtures::pipeline_config();
    config.retention.keep_days = Some(30);
    config.backfill.partitions = vec![8];
    let ctx = TestContext::with_parts(config, store, source);
    ctx.start().await;

    let coordinator = ctx.coordinator.clone();
    integration_tests::setup::wait_until(Duration::from_secs(5), move || {
        let coordinator = coordinator.clone();
        async move { coordinator.metrics().snapshot().last_retention_at.is_some() }
    })
    .await;
    assert!(ctx.store.events_in(4).is_empty());
    assert!(ctx.store.chat(4).is_some(), "descriptors outlive their events");
    assert_eq!(ctx.coordinator.metrics().events_expired.get(), 2);

    let outcomes = ctx.coordinator.run_backfill().await.unwrap();
    assert!(outcomes.contains(&(8, BackfillOutcome::Completed(CompletionReason::MaxAgeReached))));
    let positions: Vec<i64> = ctx.store.events_in(8).iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![6, 7, 8]);

    ctx.shutdown().await;
}
