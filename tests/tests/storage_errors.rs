//! Tests for storage failures in the commit path.
//!
//! These verify that nothing is lost or half-written when storage misbehaves.

use axum::http::StatusCode;
use axum_test::TestServer;
use ingest_core::{CheckpointKey, EventId, StorageErrorCode};
use integration_tests::{fixtures, setup::wait_until, setup::TestContext};
use std::time::Duration;
use store::EventStore;
use telemetry::HealthStatus;

/// A transient commit failure is retried and the batch lands
#[tokio::test]
async fn test_transient_commit_failure_is_retried() {
    let ctx = TestContext::new();
    ctx.store.fail_next_commits(1, StorageErrorCode::Conflict);
    ctx.source.push_live_events(fixtures::messages(1, 1..=3));
    ctx.start().await;

    ctx.wait_for_events(3).await;
    ctx.shutdown().await;

    assert_eq!(ctx.store.commit_count(), 1);
    assert!(ctx.coordinator.health().storage.is_healthy());
    let metrics = ctx.coordinator.metrics().snapshot();
    assert_eq!(metrics.events_flushed, 3);
    assert_eq!(metrics.batches_flushed, 1);
}

/// An outage keeps events buffered, degrades storage and recovers afterwards
#[tokio::test]
async fn test_storage_outage_keeps_events_pending() {
    let ctx = TestContext::new();
    ctx.start().await;
    ctx.store.set_unavailable(true);
    ctx.source.push_live_events(fixtures::messages(1, 1..=3));

    let coordinator = ctx.coordinator.clone();
    wait_until(Duration::from_secs(10), move || {
        let coordinator = coordinator.clone();
        async move { coordinator.health().storage.status() == HealthStatus::Degraded }
    })
    .await;

    assert_eq!(ctx.store.event_count(), 0);
    assert_eq!(ctx.coordinator.buffer().pending_len(), 3);

    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");
    server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);

    ctx.store.set_unavailable(false);
    ctx.wait_for_events(3).await;

    assert!(ctx.coordinator.health().storage.is_healthy());
    server.get("/health/ready").await.assert_status_ok();

    let live = ctx
        .store
        .get_checkpoint(CheckpointKey::live(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.last_position, Some(3));
    assert_eq!(live.total_processed, 3);

    ctx.shutdown().await;
}

/// A row storage refuses is skipped; the rest of its batch is committed
#[tokio::test]
async fn test_rejected_event_is_isolated() {
    let ctx = TestContext::new();
    ctx.store.poison(EventId::Message(2));
    ctx.source.push_live_events(fixtures::messages(1, 1..=4));
    ctx.start().await;

    ctx.wait_for_events(3).await;
    ctx.shutdown().await;

    assert_eq!(ctx.store.event_count(), 3);
    assert!(ctx.store.get_event(1, EventId::Message(2)).is_none());
    assert_eq!(ctx.coordinator.metrics().snapshot().events_skipped, 1);
}

/// Events that fail the final flush are reported, not silently dropped
#[tokio::test]
async fn test_failed_shutdown_flush_is_an_error() {
    let mut config = fixtures::pipeline_config();
    config.batch.flush_interval_secs = 3600;
    config.batch.max_size = 50;
    let ctx = TestContext::with_config(config);
    ctx.source.push_live_events(fixtures::messages(1, 1..=2));
    ctx.start().await;

    let buffer = ctx.coordinator.buffer().clone();
    wait_until(Duration::from_secs(5), move || {
        let buffer = buffer.clone();
        async move { buffer.pending_len() == 2 }
    })
    .await;

    ctx.store.set_unavailable(true);
    let err = ctx.coordinator.shutdown().await.unwrap_err();
    assert_eq!(err.error_code(), Some("DB_001"));
    assert_eq!(ctx.coordinator.buffer().pending_len(), 2);
    assert_eq!(ctx.store.event_count(), 0);
}
