//! Tests against a real PostgreSQL server.
//!
//! Requires Docker (or `CHATLOG_TEST_POSTGRES_HOST`); run with
//! `cargo test -p integration-tests --test postgres -- --ignored`.

use ingest_core::{CheckpointAdvance, CheckpointKey, EventId};
use integration_tests::{containers::TestContainers, fixtures, mocks::MockSource, setup};
use pipeline::{build_batch, BackfillOutcome, CompletionReason};
use std::sync::Arc;
use store::{EventStore, PostgresStore};

async fn connect(containers: &TestContainers) -> Arc<PostgresStore> {
    Arc::new(
        PostgresStore::connect(containers.postgres_config.clone())
            .await
            .expect("Failed to connect to PostgreSQL"),
    )
}

/// Redelivered events are upserted, not duplicated
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_duplicate_delivery_is_one_row() {
    let containers = TestContainers::start().await;
    let store = connect(&containers).await;

    let first = store
        .commit_batch(&build_batch(fixtures::messages(10, 1..=3)))
        .await
        .unwrap();
    assert_eq!(first.inserted, 3);

    let backfilled: Vec<_> = fixtures::messages(10, 2..=4)
        .into_iter()
        .map(|e| e.backfilled())
        .collect();
    let second = store.commit_batch(&build_batch(backfilled)).await.unwrap();
    assert_eq!(second.inserted, 1);
    assert_eq!(second.duplicates, 2);

    assert_eq!(store.latest_position(10).await.unwrap(), Some(4));
    assert!(store.statistics().await.unwrap().total_messages >= 4);
}

/// Checkpoints never move backwards, in either direction
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_checkpoints_are_monotonic() {
    let containers = TestContainers::start().await;
    let store = connect(&containers).await;

    let advance = |key, position| CheckpointAdvance {
        key,
        position,
        timestamp: None,
        delta_count: 1,
    };

    store.advance_checkpoint(&advance(CheckpointKey::live(11), 50)).await.unwrap();
    let live = store.advance_checkpoint(&advance(CheckpointKey::live(11), 40)).await.unwrap();
    assert_eq!(live.last_position, Some(50));
    assert_eq!(live.total_processed, 2);

    store.advance_checkpoint(&advance(CheckpointKey::backfill(11), 40)).await.unwrap();
    let backfill = store
        .advance_checkpoint(&advance(CheckpointKey::backfill(11), 50))
        .await
        .unwrap();
    assert_eq!(backfill.last_position, Some(40));

    let started = store.set_backfill_in_progress(11, true).await.unwrap();
    assert!(started.backfill_in_progress);
    let done = store.set_backfill_in_progress(11, false).await.unwrap();
    assert!(done.backfill_completed());

    let listed = store.list_checkpoints().await.unwrap();
    assert_eq!(listed.iter().filter(|c| c.partition == 11).count(), 2);
}

/// The full pipeline backfills into PostgreSQL and resumes after a restart
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_backfill_into_postgres() {
    let containers = TestContainers::start().await;
    let store = connect(&containers).await;

    let source = MockSource::new();
    source.set_history(13, fixtures::messages(13, 1..=25));

    let mut config = fixtures::pipeline_config();
    // Other suites may share the database; stay on this partition.
    config.filter.allowed_chats = vec![13];
    let coordinator = setup::pipeline_over(config.clone(), source.clone(), store.clone());
    coordinator.start().await.unwrap();

    let outcomes = coordinator.run_backfill().await.unwrap();
    assert_eq!(
        outcomes,
        vec![(13, BackfillOutcome::Completed(CompletionReason::SourceExhausted))]
    );
    coordinator.shutdown().await.unwrap();

    assert_eq!(store.latest_position(13).await.unwrap(), Some(25));
    let checkpoint = store
        .get_checkpoint(CheckpointKey::backfill(13))
        .await
        .unwrap()
        .unwrap();
    assert!(checkpoint.backfill_completed());
    assert_eq!(checkpoint.last_position, Some(1));

    // A second process sees the completed walk and leaves it alone.
    let restarted = setup::pipeline_over(config, source.clone(), store.clone());
    restarted.start().await.unwrap();
    let outcomes = restarted.run_backfill().await.unwrap();
    assert_eq!(outcomes, vec![(13, BackfillOutcome::Skipped)]);
    restarted.shutdown().await.unwrap();

    // The live feed redelivers the newest message.
    let outcome = store
        .commit_batch(&build_batch(vec![fixtures::message(13, 25)]))
        .await
        .unwrap();
    assert_eq!(outcome.duplicates, 1, "{} should already exist", EventId::Message(25));
    let live = store.get_checkpoint(CheckpointKey::live(13)).await.unwrap().unwrap();
    assert_eq!(live.last_position, Some(25));
}

/// Retention deletes old messages and actions but keeps checkpoints
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_delete_older_than() {
    let containers = TestContainers::start().await;
    let store = connect(&containers).await;

    let ancient = chrono::Utc::now() - chrono::Duration::days(2000);
    let mut join = fixtures::member_join(14, 2);
    join.occurred_at = ancient;
    let batch = build_batch(vec![
        fixtures::message_at(14, 1, ancient),
        join,
        fixtures::message(14, 3),
    ]);
    store.commit_batch(&batch).await.unwrap();

    // Other suites only write recent events.
    let outcome = store
        .delete_older_than(chrono::Utc::now() - chrono::Duration::days(1000))
        .await
        .unwrap();
    assert_eq!(outcome.messages_deleted, 1);
    assert_eq!(outcome.actions_deleted, 1);

    assert_eq!(store.latest_position(14).await.unwrap(), Some(3));
    let live = store.get_checkpoint(CheckpointKey::live(14)).await.unwrap().unwrap();
    assert_eq!(live.last_position, Some(3));
}
