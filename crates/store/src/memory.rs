//! In-memory implementation of [`EventStore`].
//!
//! Same semantics as the PostgreSQL backend: idempotent upserts, monotonic
//! checkpoints and all-or-nothing commits. Used with `storage_backend =
//! "memory"` and throughout the tests, which is why it can also be told to
//! fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_core::{
    ChatInfo, Checkpoint, CheckpointAdvance, CheckpointKey, Error, Event, EventId, PartitionId,
    Result, StorageErrorCode, UserInfo,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::store::{CommitBatch, CommitOutcome, EventStore, RetentionOutcome, StoreStatistics};

/// A descriptor with its sighting times.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighted<T> {
    pub value: T,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl<T> Sighted<T> {
    fn new(value: T, now: DateTime<Utc>) -> Self {
        Self {
            value,
            first_seen: now,
            last_seen: now,
        }
    }

    fn refresh(&mut self, value: T, now: DateTime<Utc>) {
        self.value = value;
        self.last_seen = now;
    }
}

#[derive(Debug, Default)]
struct Tables {
    events: BTreeMap<(PartitionId, EventId), Event>,
    users: HashMap<i64, Sighted<UserInfo>>,
    chats: BTreeMap<PartitionId, Sighted<ChatInfo>>,
    checkpoints: BTreeMap<CheckpointKey, Checkpoint>,
    commits: u64,
}

/// Injected failures. Each scripted entry is consumed by one commit;
/// `None` lets that commit through.
#[derive(Debug, Default)]
struct Faults {
    scripted: VecDeque<Option<StorageErrorCode>>,
    poisoned: HashSet<EventId>,
    unavailable: bool,
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` commits fail with `code`.
    pub fn fail_next_commits(&self, times: u32, code: StorageErrorCode) {
        self.script_commits((0..times).map(|_| Some(code)));
    }

    /// Replace pending injected failures with one outcome per upcoming commit.
    pub fn script_commits(&self, outcomes: impl IntoIterator<Item = Option<StorageErrorCode>>) {
        self.faults.lock().scripted = outcomes.into_iter().collect();
    }

    /// Reject every commit containing `id` with a constraint violation.
    pub fn poison(&self, id: EventId) {
        self.faults.lock().poisoned.insert(id);
    }

    /// Fail every call until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    pub fn event_count(&self) -> usize {
        self.tables.read().events.len()
    }

    pub fn get_event(&self, partition: PartitionId, id: EventId) -> Option<Event> {
        self.tables.read().events.get(&(partition, id)).cloned()
    }

    /// Stored events of a partition, ascending by id.
    pub fn events_in(&self, partition: PartitionId) -> Vec<Event> {
        self.tables
            .read()
            .events
            .range((partition, EventId::Message(i64::MIN))..)
            .take_while(|((p, _), _)| *p == partition)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn user(&self, user_id: i64) -> Option<Sighted<UserInfo>> {
        self.tables.read().users.get(&user_id).cloned()
    }

    pub fn chat(&self, chat_id: PartitionId) -> Option<Sighted<ChatInfo>> {
        self.tables.read().chats.get(&chat_id).cloned()
    }

    /// Successful commits so far.
    pub fn commit_count(&self) -> u64 {
        self.tables.read().commits
    }

    fn check_available(&self) -> Result<()> {
        if self.faults.lock().unavailable {
            return Err(Error::storage(
                StorageErrorCode::Unavailable,
                "memory store marked unavailable",
            ));
        }
        Ok(())
    }

    fn check_commit(&self, batch: &CommitBatch) -> Result<()> {
        let mut faults = self.faults.lock();
        if faults.unavailable {
            return Err(Error::storage(
                StorageErrorCode::Unavailable,
                "memory store marked unavailable",
            ));
        }
        if let Some(Some(code)) = faults.scripted.pop_front() {
            return Err(Error::storage(code, "injected commit failure"));
        }
        if let Some(event) = batch.events.iter().find(|e| faults.poisoned.contains(&e.id)) {
            return Err(Error::storage(
                StorageErrorCode::ConstraintViolation,
                format!("event {} violates a constraint", event.id),
            ));
        }
        Ok(())
    }
}

fn advance_in(tables: &mut Tables, advance: &CheckpointAdvance) -> Checkpoint {
    let checkpoint = tables
        .checkpoints
        .entry(advance.key)
        .or_insert_with(|| Checkpoint::new(advance.key));
    checkpoint.apply(advance);
    checkpoint.clone()
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn commit_batch(&self, batch: &CommitBatch) -> Result<CommitOutcome> {
        self.check_commit(batch)?;

        let now = Utc::now();
        let mut tables = self.tables.write();
        let mut outcome = CommitOutcome::default();

        for chat in &batch.chats {
            tables
                .chats
                .entry(chat.chat_id)
                .and_modify(|s| s.refresh(chat.clone(), now))
                .or_insert_with(|| Sighted::new(chat.clone(), now));
        }
        for user in &batch.users {
            tables
                .users
                .entry(user.user_id)
                .and_modify(|s| s.refresh(user.clone(), now))
                .or_insert_with(|| Sighted::new(user.clone(), now));
        }

        for event in &batch.events {
            match tables.events.get_mut(&(event.partition, event.id)) {
                Some(existing) => {
                    // Payload is refreshed; `is_backfilled` stays as first stored.
                    existing.payload = event.payload.clone();
                    outcome.duplicates += 1;
                }
                None => {
                    tables
                        .events
                        .insert((event.partition, event.id), event.clone());
                    outcome.inserted += 1;
                }
            }
        }

        let mut advances: Vec<&CheckpointAdvance> = batch.advances.iter().collect();
        advances.sort_by_key(|a| a.key);
        for advance in advances {
            advance_in(&mut tables, advance);
        }

        tables.commits += 1;
        Ok(outcome)
    }

    async fn get_checkpoint(&self, key: CheckpointKey) -> Result<Option<Checkpoint>> {
        self.check_available()?;
        Ok(self.tables.read().checkpoints.get(&key).cloned())
    }

    async fn advance_checkpoint(&self, advance: &CheckpointAdvance) -> Result<Checkpoint> {
        self.check_available()?;
        Ok(advance_in(&mut self.tables.write(), advance))
    }

    async fn set_backfill_in_progress(
        &self,
        partition: PartitionId,
        in_progress: bool,
    ) -> Result<Checkpoint> {
        self.check_available()?;
        let key = CheckpointKey::backfill(partition);
        let mut tables = self.tables.write();
        let checkpoint = tables
            .checkpoints
            .entry(key)
            .or_insert_with(|| Checkpoint::new(key));
        checkpoint.backfill_in_progress = in_progress;
        if !in_progress {
            checkpoint.last_completed_at = Some(Utc::now());
        }
        checkpoint.updated_at = Utc::now();
        Ok(checkpoint.clone())
    }

    async fn latest_position(&self, partition: PartitionId) -> Result<Option<i64>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .events
            .values()
            .filter(|e| e.partition == partition)
            .map(|e| e.position)
            .max())
    }

    async fn known_partitions(&self) -> Result<Vec<PartitionId>> {
        self.check_available()?;
        Ok(self.tables.read().chats.keys().copied().collect())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.check_available()?;
        Ok(self.tables.read().checkpoints.values().cloned().collect())
    }

    async fn statistics(&self) -> Result<StoreStatistics> {
        self.check_available()?;
        let tables = self.tables.read();
        let (messages, actions) = tables
            .events
            .values()
            .fold((0, 0), |(m, a), e| if e.is_message() { (m + 1, a) } else { (m, a + 1) });

        Ok(StoreStatistics {
            total_messages: messages,
            total_actions: actions,
            total_chats: tables.chats.len() as u64,
            total_users: tables.users.len() as u64,
            backfills_in_progress: tables
                .checkpoints
                .values()
                .filter(|c| c.backfill_in_progress)
                .count() as u64,
            latest_event_at: tables
                .events
                .values()
                .filter(|e| e.is_message())
                .map(|e| e.occurred_at)
                .max(),
        })
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<RetentionOutcome> {
        self.check_available()?;
        let mut outcome = RetentionOutcome::default();
        self.tables.write().events.retain(|_, e| {
            if e.occurred_at >= cutoff {
                return true;
            }
            if e.is_message() {
                outcome.messages_deleted += 1;
            } else {
                outcome.actions_deleted += 1;
            }
            false
        });
        Ok(outcome)
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
