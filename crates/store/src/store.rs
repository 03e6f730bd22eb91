//! The storage contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_core::{
    ChatInfo, Checkpoint, CheckpointAdvance, CheckpointKey, Event, PartitionId, Result, UserInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything one flush writes in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub events: Vec<Event>,
    pub users: Vec<UserInfo>,
    pub chats: Vec<ChatInfo>,
    pub advances: Vec<CheckpointAdvance>,
}

impl CommitBatch {
    /// Build a batch from events, deriving descriptors from the events.
    ///
    /// Checkpoint advances are left to the caller.
    pub fn from_events(events: Vec<Event>) -> Self {
        let mut users: HashMap<i64, UserInfo> = HashMap::new();
        let mut chats: HashMap<PartitionId, ChatInfo> = HashMap::new();
        for event in &events {
            if let Some(sender) = &event.sender {
                users.insert(sender.user_id, sender.clone());
            }
            chats.insert(event.chat.chat_id, event.chat.clone());
        }

        let mut users: Vec<_> = users.into_values().collect();
        users.sort_by_key(|u| u.user_id);
        let mut chats: Vec<_> = chats.into_values().collect();
        chats.sort_by_key(|c| c.chat_id);

        Self {
            events,
            users,
            chats,
            advances: Vec::new(),
        }
    }

    pub fn with_advances(mut self, advances: Vec<CheckpointAdvance>) -> Self {
        self.advances = advances;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.advances.is_empty()
    }

    /// Partitions whose checkpoints this batch writes, ascending.
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self.advances.iter().map(|a| a.key.partition).collect();
        partitions.sort_unstable();
        partitions.dedup();
        partitions
    }
}

/// Result of a committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    /// Rows that did not exist before.
    pub inserted: u64,
    /// Rows that already existed and were left in place.
    pub duplicates: u64,
}

/// Rows removed by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionOutcome {
    pub messages_deleted: u64,
    pub actions_deleted: u64,
}

impl RetentionOutcome {
    pub fn total(&self) -> u64 {
        self.messages_deleted + self.actions_deleted
    }
}

/// Row counts for the reporting surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub total_messages: u64,
    pub total_actions: u64,
    pub total_chats: u64,
    pub total_users: u64,
    pub backfills_in_progress: u64,
    pub latest_event_at: Option<DateTime<Utc>>,
}

/// Durable storage for events, descriptors and checkpoints.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Upsert events and descriptors and advance checkpoints, atomically.
    async fn commit_batch(&self, batch: &CommitBatch) -> Result<CommitOutcome>;

    async fn get_checkpoint(&self, key: CheckpointKey) -> Result<Option<Checkpoint>>;

    /// Move a checkpoint in its purpose's direction, creating it if needed.
    async fn advance_checkpoint(&self, advance: &CheckpointAdvance) -> Result<Checkpoint>;

    /// Set or clear the backfill flag on the partition's backfill checkpoint.
    ///
    /// Clearing the flag also stamps `last_completed_at`.
    async fn set_backfill_in_progress(
        &self,
        partition: PartitionId,
        in_progress: bool,
    ) -> Result<Checkpoint>;

    /// Highest stored position in a partition.
    async fn latest_position(&self, partition: PartitionId) -> Result<Option<i64>>;

    /// Partitions with a stored chat descriptor, ascending.
    async fn known_partitions(&self) -> Result<Vec<PartitionId>>;

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>>;

    async fn statistics(&self) -> Result<StoreStatistics>;

    /// Delete messages and actions that occurred before `cutoff`.
    ///
    /// Descriptors and checkpoints are kept.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<RetentionOutcome>;

    async fn ping(&self) -> Result<()>;
}
