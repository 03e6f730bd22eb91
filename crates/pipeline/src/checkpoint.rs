//! Serialised access to durable cursors.
//!
//! Every write to a partition's checkpoints goes through that partition's
//! async mutex, so advances within a partition are strictly ordered. Batch
//! commits take the locks of all their partitions in ascending order. The
//! latest known state is mirrored in a snapshot map for reporting.

use ingest_core::{Checkpoint, CheckpointAdvance, CheckpointKey, PartitionId, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use store::{CommitBatch, CommitOutcome, EventStore};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

pub struct CheckpointStore {
    store: Arc<dyn EventStore>,
    locks: Mutex<HashMap<PartitionId, Arc<AsyncMutex<()>>>>,
    snapshot: RwLock<BTreeMap<CheckpointKey, Checkpoint>>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(BTreeMap::new()),
        }
    }

    fn partition_lock(&self, partition: PartitionId) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(partition).or_default().clone()
    }

    async fn lock_partition(&self, partition: PartitionId) -> OwnedMutexGuard<()> {
        self.partition_lock(partition).lock_owned().await
    }

    fn remember(&self, checkpoint: Checkpoint) -> Checkpoint {
        self.snapshot
            .write()
            .insert(checkpoint.key(), checkpoint.clone());
        checkpoint
    }

    /// Populate the snapshot from storage. Returns the number loaded.
    pub async fn load(&self) -> Result<usize> {
        let checkpoints = self.store.list_checkpoints().await?;
        let count = checkpoints.len();
        {
            let mut snapshot = self.snapshot.write();
            for checkpoint in checkpoints {
                snapshot.insert(checkpoint.key(), checkpoint);
            }
        }
        info!(count, "Loaded checkpoints");
        Ok(count)
    }

    /// Read a checkpoint from storage, refreshing the snapshot.
    pub async fn get(&self, key: CheckpointKey) -> Result<Option<Checkpoint>> {
        let checkpoint = self.store.get_checkpoint(key).await?;
        Ok(checkpoint.map(|c| self.remember(c)))
    }

    pub async fn advance(&self, advance: &CheckpointAdvance) -> Result<Checkpoint> {
        let _guard = self.lock_partition(advance.key.partition).await;
        let checkpoint = self.store.advance_checkpoint(advance).await?;
        debug!(
            partition = advance.key.partition,
            purpose = %advance.key.purpose,
            position = ?checkpoint.last_position,
            "Checkpoint advanced"
        );
        Ok(self.remember(checkpoint))
    }

    pub async fn begin_backfill(&self, partition: PartitionId) -> Result<Checkpoint> {
        let _guard = self.lock_partition(partition).await;
        let checkpoint = self.store.set_backfill_in_progress(partition, true).await?;
        Ok(self.remember(checkpoint))
    }

    pub async fn end_backfill(&self, partition: PartitionId) -> Result<Checkpoint> {
        let _guard = self.lock_partition(partition).await;
        let checkpoint = self.store.set_backfill_in_progress(partition, false).await?;
        Ok(self.remember(checkpoint))
    }

    /// Commit a batch while holding the locks of every partition it advances.
    pub async fn commit(&self, batch: &CommitBatch) -> Result<CommitOutcome> {
        let mut guards = Vec::new();
        for partition in batch.partitions() {
            guards.push(self.lock_partition(partition).await);
        }

        let outcome = self.store.commit_batch(batch).await?;

        // The batch is durable from here; mirror it without another read.
        {
            let mut snapshot = self.snapshot.write();
            for advance in &batch.advances {
                snapshot
                    .entry(advance.key)
                    .or_insert_with(|| Checkpoint::new(advance.key))
                    .apply(advance);
            }
        }

        drop(guards);
        Ok(outcome)
    }

    /// Last known state of a checkpoint, without touching storage.
    pub fn cached(&self, key: CheckpointKey) -> Option<Checkpoint> {
        self.snapshot.read().get(&key).cloned()
    }

    pub fn snapshot(&self) -> Vec<Checkpoint> {
        self.snapshot.read().values().cloned().collect()
    }

    /// Partitions whose backfill flag is still set and must resume.
    pub fn in_progress(&self) -> Vec<PartitionId> {
        self.snapshot
            .read()
            .values()
            .filter(|c| c.backfill_in_progress)
            .map(|c| c.partition)
            .collect()
    }
}
