//! Tests for the reporting endpoints.
//!
//! These verify the health, stats and backfill endpoints return correct
//! status and structure over a running pipeline.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::{fixtures, setup::TestContext};

fn server(ctx: &TestContext) -> TestServer {
    TestServer::new(ctx.router.clone()).expect("Failed to create test server")
}

/// Test / lists the reporting endpoints
#[tokio::test]
async fn test_index_lists_endpoints() {
    let ctx = TestContext::new();
    let response = server(&ctx).get("/").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["name"], "chatlog-ingest");
    assert_eq!(body["status"], "running");
    assert_eq!(body["endpoints"]["stats"], "/stats");
    assert_eq!(body["endpoints"]["backfill"], "/backfill");
}

/// Test /health endpoint returns proper structure
#[tokio::test]
async fn test_health_endpoint_structure() {
    let ctx = TestContext::new();
    let response = server(&ctx).get("/health").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    for field in [
        "status",
        "timestamp",
        "storage_reachable",
        "components",
        "flush_stale",
        "pending_events",
        "backfills_paused",
    ] {
        assert!(body.get(field).is_some(), "Response should have '{}' field", field);
    }
    assert_eq!(body["components"].as_array().map(Vec::len), Some(2));
}

/// Test /health reflects startup: unhealthy before, healthy once the source answers
#[tokio::test]
async fn test_health_becomes_healthy_after_start() {
    let ctx = TestContext::new();
    let server = server(&ctx);

    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["storage_reachable"], true);

    ctx.start().await;
    let coordinator = ctx.coordinator.clone();
    integration_tests::setup::wait_until(std::time::Duration::from_secs(5), move || {
        let coordinator = coordinator.clone();
        async move { coordinator.health().source.is_healthy() }
    })
    .await;

    let body: serde_json::Value = server.get("/health").await.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["flush_stale"], false);

    ctx.shutdown().await;
}

/// Test /health/ready follows storage readiness
#[tokio::test]
async fn test_ready_endpoint() {
    let ctx = TestContext::new();
    let server = server(&ctx);

    server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);

    ctx.start().await;
    server.get("/health/ready").await.assert_status_ok();

    ctx.shutdown().await;
}

/// Test /health/live always returns 200 while the service runs
#[tokio::test]
async fn test_live_endpoint() {
    let ctx = TestContext::new();
    server(&ctx).get("/health/live").await.assert_status_ok();
}

/// Test a failing source degrades health and reports paused backfills
#[tokio::test]
async fn test_source_failure_reports_paused_backfill() {
    let mut config = fixtures::pipeline_config();
    config.backfill.partitions = vec![7];
    let ctx = TestContext::with_config(config);
    ctx.source.set_should_fail(true);
    ctx.start().await;

    ctx.coordinator.run_backfill().await.unwrap();

    let body: serde_json::Value = server(&ctx).get("/health").await.json();
    assert_eq!(body["backfills_paused"], 1);
    assert_ne!(body["status"], "healthy");

    let backfill: serde_json::Value = server(&ctx).get("/backfill").await.json();
    assert_eq!(backfill["in_progress"], serde_json::json!([7]));
    assert_eq!(backfill["partitions"][0]["phase"], "PAUSED");
    assert!(backfill["partitions"][0]["last_error"].is_string());

    ctx.shutdown().await;
}

/// Test /stats reports pipeline counters and storage totals
#[tokio::test]
async fn test_stats_endpoint() {
    let ctx = TestContext::new();
    ctx.source.push_live_events(fixtures::messages(1, 1..=4));
    ctx.start().await;
    ctx.wait_for_events(4).await;

    let response = server(&ctx).get("/stats").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["pipeline"]["events_accepted"], 4);
    assert_eq!(body["pipeline"]["events_flushed"], 4);
    assert_eq!(body["storage"]["total_messages"], 4);
    assert_eq!(body["storage"]["total_chats"], 1);
    assert_eq!(body["live_offset"], 4);

    ctx.shutdown().await;
}

/// Test /stats serves cached totals until asked to refresh
#[tokio::test]
async fn test_stats_cache_refresh() {
    let ctx = TestContext::new();
    let server = server(&ctx);
    ctx.start().await;

    let body: serde_json::Value = server.get("/stats").await.json();
    assert_eq!(body["storage"]["total_messages"], 0);

    ctx.source.push_live_events(fixtures::messages(1, 1..=2));
    ctx.wait_for_events(2).await;

    let body: serde_json::Value = server.get("/stats").await.json();
    assert_eq!(body["storage"]["total_messages"], 0);

    let body: serde_json::Value = server.get("/stats?refresh=true").await.json();
    assert_eq!(body["storage"]["total_messages"], 2);

    ctx.shutdown().await;
}

/// Test /stats returns a coded 503 when storage cannot be read
#[tokio::test]
async fn test_stats_storage_unavailable() {
    let ctx = TestContext::new();
    ctx.store.set_unavailable(true);

    let response = server(&ctx).get("/stats").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);

    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "DB_001");

    let health: serde_json::Value = server(&ctx).get("/health").await.json();
    assert_eq!(health["storage_reachable"], false);
}

/// Test /backfill reports a completed walk and its checkpoint
#[tokio::test]
async fn test_backfill_endpoint_after_walk() {
    let mut config = fixtures::pipeline_config();
    config.backfill.partitions = vec![3];
    let ctx = TestContext::with_config(config);
    ctx.source.set_history(3, fixtures::messages(3, 1..=12));
    ctx.start().await;

    ctx.coordinator.run_backfill().await.unwrap();

    let response = server(&ctx).get("/backfill").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["in_progress"], serde_json::json!([]));

    let progress = &body["partitions"][0];
    assert_eq!(progress["partition"], 3);
    assert_eq!(progress["phase"], "COMPLETED");
    assert_eq!(progress["completion"], "source_exhausted");
    assert_eq!(progress["events_buffered"], 12);
    assert_eq!(progress["chunks_fetched"], 2);

    let checkpoints = body["checkpoints"].as_array().unwrap();
    let backfill = checkpoints
        .iter()
        .find(|c| c["purpose"] == "backfill")
        .expect("backfill checkpoint");
    assert_eq!(backfill["last_position"], 1);
    assert_eq!(backfill["total_processed"], 12);
    assert_eq!(backfill["backfill_in_progress"], false);

    ctx.shutdown().await;
}
