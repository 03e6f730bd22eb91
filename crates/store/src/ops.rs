//! PostgreSQL implementation of [`EventStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_core::{
    ChatInfo, Checkpoint, CheckpointAdvance, CheckpointKey, CheckpointPurpose, Error, Event,
    EventId, EventKind, PartitionId, Result, StorageErrorCode, UserInfo,
};
use std::collections::HashSet;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Row, Transaction};
use tracing::{debug, error};
use uuid::Uuid;

use crate::client::PostgresClient;
use crate::config::PostgresConfig;
use crate::errors::map_pg_error;
use crate::store::{CommitBatch, CommitOutcome, EventStore, RetentionOutcome, StoreStatistics};

/// Rows per multi-row INSERT. Keeps parameter count well under the 65535 limit.
const ROWS_PER_STATEMENT: usize = 500;

const CHECKPOINT_COLUMNS: &str = "chat_id, purpose, last_position, last_timestamp, \
     total_processed, backfill_in_progress, last_completed_at, updated_at";

type Param<'a> = &'a (dyn ToSql + Sync);

/// Store backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresStore {
    client: PostgresClient,
}

impl PostgresStore {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }

    /// Connect, apply the schema and return a ready store.
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let client = PostgresClient::connect(config).await?;
        client.migrate().await?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &PostgresClient {
        &self.client
    }
}

/// Builds `($1, $2, ...), ($n+1, ...)` for `rows` rows of `cols` columns.
fn values_clause(rows: usize, cols: usize) -> String {
    (0..rows)
        .map(|i| {
            let start = i * cols + 1;
            let placeholders: Vec<String> =
                (start..start + cols).map(|n| format!("${}", n)).collect();
            format!("({})", placeholders.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Remove null bytes, which TEXT columns reject.
fn sanitize(s: &str) -> String {
    s.replace('\0', "")
}

fn count_inserted(rows: &[Row]) -> u64 {
    rows.iter().filter(|r| r.get::<_, bool>("inserted")).count() as u64
}

fn row_to_checkpoint(row: &Row) -> Result<Checkpoint> {
    let purpose: String = row.get("purpose");
    let purpose = CheckpointPurpose::parse(&purpose).ok_or_else(|| {
        Error::storage(
            StorageErrorCode::Query,
            format!("unknown checkpoint purpose '{}'", purpose),
        )
    })?;
    let total: i64 = row.get("total_processed");

    Ok(Checkpoint {
        partition: row.get("chat_id"),
        purpose,
        last_position: row.get("last_position"),
        last_timestamp: row.get("last_timestamp"),
        total_processed: u64::try_from(total).unwrap_or(0),
        backfill_in_progress: row.get("backfill_in_progress"),
        last_completed_at: row.get("last_completed_at"),
        updated_at: row.get("updated_at"),
    })
}

async fn upsert_chats(tx: &Transaction<'_>, chats: &[ChatInfo]) -> Result<()> {
    const COLS: usize = 4;
    for chunk in chats.chunks(ROWS_PER_STATEMENT) {
        let query = format!(
            r#"
            INSERT INTO chat_chats (chat_id, chat_type, title, username)
            VALUES {}
            ON CONFLICT (chat_id) DO UPDATE SET
                chat_type = EXCLUDED.chat_type,
                title = COALESCE(EXCLUDED.title, chat_chats.title),
                username = COALESCE(EXCLUDED.username, chat_chats.username),
                last_seen = now()
            "#,
            values_clause(chunk.len(), COLS)
        );

        let kinds: Vec<&'static str> = chunk.iter().map(|c| c.kind.as_str()).collect();
        let titles: Vec<Option<String>> =
            chunk.iter().map(|c| c.title.as_deref().map(sanitize)).collect();

        let mut params: Vec<Param<'_>> = Vec::with_capacity(chunk.len() * COLS);
        for (i, chat) in chunk.iter().enumerate() {
            params.push(&chat.chat_id);
            params.push(&kinds[i]);
            params.push(&titles[i]);
            params.push(&chat.username);
        }

        tx.execute(&query, &params)
            .await
            .map_err(|e| map_pg_error("upsert chats", e))?;
    }
    Ok(())
}

async fn upsert_users(tx: &Transaction<'_>, users: &[UserInfo]) -> Result<()> {
    const COLS: usize = 6;
    for chunk in users.chunks(ROWS_PER_STATEMENT) {
        let query = format!(
            r#"
            INSERT INTO chat_users (user_id, is_bot, first_name, last_name, username, language_code)
            VALUES {}
            ON CONFLICT (user_id) DO UPDATE SET
                is_bot = EXCLUDED.is_bot,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                username = EXCLUDED.username,
                language_code = COALESCE(EXCLUDED.language_code, chat_users.language_code),
                last_seen = now()
            "#,
            values_clause(chunk.len(), COLS)
        );

        let names: Vec<(String, Option<String>)> = chunk
            .iter()
            .map(|u| (sanitize(&u.first_name), u.last_name.as_deref().map(sanitize)))
            .collect();

        let mut params: Vec<Param<'_>> = Vec::with_capacity(chunk.len() * COLS);
        for (i, user) in chunk.iter().enumerate() {
            params.push(&user.user_id);
            params.push(&user.is_bot);
            params.push(&names[i].0);
            params.push(&names[i].1);
            params.push(&user.username);
            params.push(&user.language_code);
        }

        tx.execute(&query, &params)
            .await
            .map_err(|e| map_pg_error("upsert users", e))?;
    }
    Ok(())
}

struct MessageRow<'a> {
    message_id: i64,
    message_type: &'static str,
    sender_id: Option<i64>,
    event: &'a Event,
}

struct ActionRow<'a> {
    action_id: Uuid,
    action_type: &'static str,
    actor_id: Option<i64>,
    event: &'a Event,
}

async fn insert_messages(tx: &Transaction<'_>, rows: &[MessageRow<'_>]) -> Result<u64> {
    const COLS: usize = 8;
    let mut inserted = 0;
    for chunk in rows.chunks(ROWS_PER_STATEMENT) {
        let query = format!(
            r#"
            INSERT INTO chat_messages (
                chat_id, message_id, position, message_type, sender_id,
                sent_at, content, is_backfilled
            ) VALUES {}
            ON CONFLICT (chat_id, message_id) DO UPDATE SET
                content = EXCLUDED.content,
                sender_id = COALESCE(EXCLUDED.sender_id, chat_messages.sender_id),
                updated_at = now()
            RETURNING (xmax = 0) AS inserted
            "#,
            values_clause(chunk.len(), COLS)
        );

        let mut params: Vec<Param<'_>> = Vec::with_capacity(chunk.len() * COLS);
        for row in chunk {
            params.push(&row.event.partition);
            params.push(&row.message_id);
            params.push(&row.event.position);
            params.push(&row.message_type);
            params.push(&row.sender_id);
            params.push(&row.event.occurred_at);
            params.push(&row.event.payload);
            params.push(&row.event.is_backfilled);
        }

        let result = tx.query(&query, &params).await.map_err(|e| {
            error!(count = chunk.len(), error = %e, "Failed to upsert messages");
            map_pg_error("upsert messages", e)
        })?;
        inserted += count_inserted(&result);
    }
    Ok(inserted)
}

async fn insert_actions(tx: &Transaction<'_>, rows: &[ActionRow<'_>]) -> Result<u64> {
    const COLS: usize = 8;
    let mut inserted = 0;
    for chunk in rows.chunks(ROWS_PER_STATEMENT) {
        let query = format!(
            r#"
            INSERT INTO chat_actions (
                chat_id, action_id, action_type, position, actor_id,
                occurred_at, content, is_backfilled
            ) VALUES {}
            ON CONFLICT (chat_id, action_id) DO UPDATE SET
                content = EXCLUDED.content,
                updated_at = now()
            RETURNING (xmax = 0) AS inserted
            "#,
            values_clause(chunk.len(), COLS)
        );

        let mut params: Vec<Param<'_>> = Vec::with_capacity(chunk.len() * COLS);
        for row in chunk {
            params.push(&row.event.partition);
            params.push(&row.action_id);
            params.push(&row.action_type);
            params.push(&row.event.position);
            params.push(&row.actor_id);
            params.push(&row.event.occurred_at);
            params.push(&row.event.payload);
            params.push(&row.event.is_backfilled);
        }

        let result = tx.query(&query, &params).await.map_err(|e| {
            error!(count = chunk.len(), error = %e, "Failed to upsert actions");
            map_pg_error("upsert actions", e)
        })?;
        inserted += count_inserted(&result);
    }
    Ok(inserted)
}

/// Monotonic advance: GREATEST for live cursors, LEAST for backfill cursors.
/// Both ignore NULL, so the first advance simply sets the position.
async fn advance_in(tx: &Transaction<'_>, advance: &CheckpointAdvance) -> Result<Checkpoint> {
    let query = format!(
        r#"
        INSERT INTO chat_checkpoints (chat_id, purpose, last_position, last_timestamp, total_processed)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (chat_id, purpose) DO UPDATE SET
            last_position = CASE
                WHEN chat_checkpoints.purpose = 'live'
                    THEN GREATEST(chat_checkpoints.last_position, EXCLUDED.last_position)
                ELSE LEAST(chat_checkpoints.last_position, EXCLUDED.last_position)
            END,
            last_timestamp = GREATEST(chat_checkpoints.last_timestamp, EXCLUDED.last_timestamp),
            total_processed = chat_checkpoints.total_processed + EXCLUDED.total_processed,
            updated_at = now()
        RETURNING {}
        "#,
        CHECKPOINT_COLUMNS
    );

    let delta = i64::try_from(advance.delta_count).unwrap_or(i64::MAX);
    let row = tx
        .query_one(
            &query,
            &[
                &advance.key.partition,
                &advance.key.purpose.as_str(),
                &advance.position,
                &advance.timestamp,
                &delta,
            ],
        )
        .await
        .map_err(|e| map_pg_error("advance checkpoint", e))?;

    row_to_checkpoint(&row)
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn commit_batch(&self, batch: &CommitBatch) -> Result<CommitOutcome> {
        if batch.is_empty() {
            return Ok(CommitOutcome::default());
        }

        let mut seen: HashSet<(EventId, PartitionId)> = HashSet::with_capacity(batch.events.len());
        let mut messages = Vec::new();
        let mut actions = Vec::new();
        let mut repeated = 0u64;

        for event in &batch.events {
            if !seen.insert(event.key()) {
                repeated += 1;
                continue;
            }
            let sender_id = event.sender.as_ref().map(|s| s.user_id);
            match (event.id, event.kind) {
                (EventId::Message(message_id), EventKind::Message(kind)) => {
                    messages.push(MessageRow {
                        message_id,
                        message_type: kind.as_str(),
                        sender_id,
                        event,
                    })
                }
                (EventId::Action(action_id), EventKind::Action(kind)) => actions.push(ActionRow {
                    action_id,
                    action_type: kind.as_str(),
                    actor_id: sender_id,
                    event,
                }),
                (id, _) => {
                    return Err(Error::storage(
                        StorageErrorCode::ConstraintViolation,
                        format!("event {} in chat {} has a mismatched kind", id, event.partition),
                    ))
                }
            }
        }

        let mut conn = self.client.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| map_pg_error("begin transaction", e))?;

        upsert_chats(&tx, &batch.chats).await?;
        upsert_users(&tx, &batch.users).await?;

        let inserted = insert_messages(&tx, &messages).await? + insert_actions(&tx, &actions).await?;

        // Lock order is the ascending order of the advances.
        let mut advances: Vec<&CheckpointAdvance> = batch.advances.iter().collect();
        advances.sort_by_key(|a| a.key);
        for advance in advances {
            advance_in(&tx, advance).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_pg_error("commit transaction", e))?;

        let written = (messages.len() + actions.len()) as u64;
        let outcome = CommitOutcome {
            inserted,
            duplicates: written - inserted + repeated,
        };
        debug!(
            events = batch.events.len(),
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "Committed batch"
        );
        Ok(outcome)
    }

    async fn get_checkpoint(&self, key: CheckpointKey) -> Result<Option<Checkpoint>> {
        let conn = self.client.conn().await?;
        let query = format!(
            "SELECT {} FROM chat_checkpoints WHERE chat_id = $1 AND purpose = $2",
            CHECKPOINT_COLUMNS
        );
        let row = conn
            .query_opt(&query, &[&key.partition, &key.purpose.as_str()])
            .await
            .map_err(|e| map_pg_error("get checkpoint", e))?;
        row.as_ref().map(row_to_checkpoint).transpose()
    }

    async fn advance_checkpoint(&self, advance: &CheckpointAdvance) -> Result<Checkpoint> {
        let mut conn = self.client.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| map_pg_error("begin transaction", e))?;
        let checkpoint = advance_in(&tx, advance).await?;
        tx.commit()
            .await
            .map_err(|e| map_pg_error("commit checkpoint", e))?;
        Ok(checkpoint)
    }

    async fn set_backfill_in_progress(
        &self,
        partition: PartitionId,
        in_progress: bool,
    ) -> Result<Checkpoint> {
        let conn = self.client.conn().await?;
        let completed_at: Option<DateTime<Utc>> = (!in_progress).then(Utc::now);
        let query = format!(
            r#"
            INSERT INTO chat_checkpoints (chat_id, purpose, backfill_in_progress, last_completed_at)
            VALUES ($1, 'backfill', $2, $3)
            ON CONFLICT (chat_id, purpose) DO UPDATE SET
                backfill_in_progress = EXCLUDED.backfill_in_progress,
                last_completed_at = COALESCE(EXCLUDED.last_completed_at, chat_checkpoints.last_completed_at),
                updated_at = now()
            RETURNING {}
            "#,
            CHECKPOINT_COLUMNS
        );
        let row = conn
            .query_one(&query, &[&partition, &in_progress, &completed_at])
            .await
            .map_err(|e| map_pg_error("set backfill flag", e))?;
        row_to_checkpoint(&row)
    }

    async fn latest_position(&self, partition: PartitionId) -> Result<Option<i64>> {
        let conn = self.client.conn().await?;
        let row = conn
            .query_one(
                r#"
                SELECT GREATEST(
                    (SELECT MAX(position) FROM chat_messages WHERE chat_id = $1),
                    (SELECT MAX(position) FROM chat_actions WHERE chat_id = $1)
                ) AS latest
                "#,
                &[&partition],
            )
            .await
            .map_err(|e| map_pg_error("latest position", e))?;
        Ok(row.get("latest"))
    }

    async fn known_partitions(&self) -> Result<Vec<PartitionId>> {
        let conn = self.client.conn().await?;
        let rows = conn
            .query("SELECT chat_id FROM chat_chats ORDER BY chat_id", &[])
            .await
            .map_err(|e| map_pg_error("list chats", e))?;
        Ok(rows.iter().map(|r| r.get("chat_id")).collect())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.client.conn().await?;
        let query = format!(
            "SELECT {} FROM chat_checkpoints ORDER BY chat_id, purpose",
            CHECKPOINT_COLUMNS
        );
        let rows = conn
            .query(&query, &[])
            .await
            .map_err(|e| map_pg_error("list checkpoints", e))?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn statistics(&self) -> Result<StoreStatistics> {
        let conn = self.client.conn().await?;
        let row = conn
            .query_one(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM chat_messages) AS total_messages,
                    (SELECT COUNT(*) FROM chat_actions) AS total_actions,
                    (SELECT COUNT(*) FROM chat_chats) AS total_chats,
                    (SELECT COUNT(*) FROM chat_users) AS total_users,
                    (SELECT COUNT(*) FROM chat_checkpoints
                        WHERE purpose = 'backfill' AND backfill_in_progress) AS backfills_in_progress,
                    (SELECT MAX(sent_at) FROM chat_messages) AS latest_event_at
                "#,
                &[],
            )
            .await
            .map_err(|e| map_pg_error("statistics", e))?;

        let count = |name: &str| -> u64 { u64::try_from(row.get::<_, i64>(name)).unwrap_or(0) };
        Ok(StoreStatistics {
            total_messages: count("total_messages"),
            total_actions: count("total_actions"),
            total_chats: count("total_chats"),
            total_users: count("total_users"),
            backfills_in_progress: count("backfills_in_progress"),
            latest_event_at: row.get("latest_event_at"),
        })
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<RetentionOutcome> {
        let mut conn = self.client.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| map_pg_error("begin transaction", e))?;

        let messages_deleted = tx
            .execute("DELETE FROM chat_messages WHERE sent_at < $1", &[&cutoff])
            .await
            .map_err(|e| map_pg_error("delete old messages", e))?;
        let actions_deleted = tx
            .execute("DELETE FROM chat_actions WHERE occurred_at < $1", &[&cutoff])
            .await
            .map_err(|e| map_pg_error("delete old actions", e))?;

        tx.commit()
            .await
            .map_err(|e| map_pg_error("commit transaction", e))?;

        debug!(%cutoff, messages_deleted, actions_deleted, "Deleted old events");
        Ok(RetentionOutcome {
            messages_deleted,
            actions_deleted,
        })
    }

    async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }
}
