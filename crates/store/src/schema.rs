//! PostgreSQL table schemas.
//!
//! - messages and actions are keyed on (chat_id, natural id)
//! - free-form content is JSONB and never inspected
//! - checkpoints are keyed on (chat_id, purpose)

/// Chat descriptors, refreshed on sight.
pub const CREATE_CHATS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS chat_chats (
    chat_id BIGINT PRIMARY KEY,
    chat_type TEXT NOT NULL,
    title TEXT,
    username TEXT,
    first_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_seen TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// User descriptors, refreshed on sight.
pub const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS chat_users (
    user_id BIGINT PRIMARY KEY,
    is_bot BOOLEAN NOT NULL DEFAULT FALSE,
    first_name TEXT NOT NULL,
    last_name TEXT,
    username TEXT,
    language_code TEXT,
    first_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_seen TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

pub const CREATE_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS chat_messages (
    chat_id BIGINT NOT NULL,
    message_id BIGINT NOT NULL,
    position BIGINT NOT NULL,
    message_type TEXT NOT NULL,
    sender_id BIGINT,
    sent_at TIMESTAMPTZ NOT NULL,
    content JSONB NOT NULL DEFAULT '{}'::jsonb,
    is_backfilled BOOLEAN NOT NULL DEFAULT FALSE,
    ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (chat_id, message_id)
)
"#;

pub const CREATE_ACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS chat_actions (
    chat_id BIGINT NOT NULL,
    action_id UUID NOT NULL,
    action_type TEXT NOT NULL,
    position BIGINT NOT NULL,
    actor_id BIGINT,
    occurred_at TIMESTAMPTZ NOT NULL,
    content JSONB NOT NULL DEFAULT '{}'::jsonb,
    is_backfilled BOOLEAN NOT NULL DEFAULT FALSE,
    ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (chat_id, action_id)
)
"#;

pub const CREATE_CHECKPOINTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS chat_checkpoints (
    chat_id BIGINT NOT NULL,
    purpose TEXT NOT NULL CHECK (purpose IN ('live', 'backfill')),
    last_position BIGINT,
    last_timestamp TIMESTAMPTZ,
    total_processed BIGINT NOT NULL DEFAULT 0,
    backfill_in_progress BOOLEAN NOT NULL DEFAULT FALSE,
    last_completed_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (chat_id, purpose)
)
"#;

pub const CREATE_MESSAGES_POSITION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_chat_messages_position
    ON chat_messages (chat_id, position DESC)
"#;

pub const CREATE_ACTIONS_POSITION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_chat_actions_position
    ON chat_actions (chat_id, position DESC)
"#;

pub const CREATE_MESSAGES_SENT_AT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_chat_messages_sent_at
    ON chat_messages (sent_at DESC)
"#;

pub const CREATE_ACTIONS_OCCURRED_AT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_chat_actions_occurred_at
    ON chat_actions (occurred_at)
"#;

/// Returns all DDL statements in order.
pub fn all_tables() -> Vec<&'static str> {
    vec![
        CREATE_CHATS_TABLE,
        CREATE_USERS_TABLE,
        CREATE_MESSAGES_TABLE,
        CREATE_ACTIONS_TABLE,
        CREATE_CHECKPOINTS_TABLE,
        CREATE_MESSAGES_POSITION_INDEX,
        CREATE_ACTIONS_POSITION_INDEX,
        CREATE_MESSAGES_SENT_AT_INDEX,
        CREATE_ACTIONS_OCCURRED_AT_INDEX,
    ]
}
