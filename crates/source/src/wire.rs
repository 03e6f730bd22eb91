//! Wire payload decoding.
//!
//! ```json
//! {
//!   "message_id": 42,
//!   "chat": {"id": -1001, "type": "supergroup", "title": "rust"},
//!   "from": {"id": 7, "is_bot": false, "first_name": "Ada"},
//!   "date": 1700000000,
//!   "message_type": "text",
//!   "content": {"text": "hello"}
//! }
//! ```
//!
//! Actions carry `action_type` (and optionally `action_id`) instead of a
//! message type. `position` defaults to `message_id`. An action without an
//! `action_id` gets one derived from chat, position and action type.

use chrono::{DateTime, Utc};
use ingest_core::{
    ActionType, ChatInfo, ChatKind, Event, EventId, EventKind, MessageType, PartitionId, UserInfo,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::source::SourceItem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireChat {
    pub id: PartitionId,
    #[serde(rename = "type", default)]
    pub kind: ChatKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

/// Raw event as delivered by the source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub action_id: Option<Uuid>,
    #[serde(default)]
    pub action_type: Option<String>,
    #[serde(default)]
    pub chat: Option<WireChat>,
    #[serde(default)]
    pub from: Option<WireUser>,
    /// Unix seconds.
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl From<WireChat> for ChatInfo {
    fn from(chat: WireChat) -> Self {
        ChatInfo {
            chat_id: chat.id,
            kind: chat.kind,
            title: chat.title,
            username: chat.username,
        }
    }
}

impl From<WireUser> for UserInfo {
    fn from(user: WireUser) -> Self {
        UserInfo {
            user_id: user.id,
            is_bot: user.is_bot,
            first_name: user.first_name,
            last_name: user.last_name,
            username: user.username,
            language_code: user.language_code,
        }
    }
}

impl WireEvent {
    /// Convert into a domain event, or explain why not.
    pub fn into_event(self) -> Result<Event, String> {
        let chat = self.chat.ok_or("missing chat")?;
        let secs = self.date.ok_or("missing date")?;
        let occurred_at: DateTime<Utc> =
            DateTime::from_timestamp(secs, 0).ok_or_else(|| format!("date {} out of range", secs))?;

        let (id, kind, position) = match (self.action_type, self.message_id) {
            (Some(action_type), message_id) => {
                let position = self
                    .position
                    .or(message_id)
                    .ok_or("action without position")?;
                let id = match self.action_id {
                    Some(id) => EventId::Action(id),
                    None => EventId::derived_action(chat.id, position, &action_type),
                };
                let action: ActionType =
                    serde_json::from_value(serde_json::Value::String(action_type))
                        .map_err(|e| format!("invalid action type: {}", e))?;
                (id, EventKind::Action(action), position)
            }
            (None, Some(message_id)) => {
                let message_type = match self.message_type {
                    Some(name) => serde_json::from_value(serde_json::Value::String(name.clone()))
                        .map_err(|_| format!("unknown message type '{}'", name))?,
                    None => MessageType::default(),
                };
                (
                    EventId::Message(message_id),
                    EventKind::Message(message_type),
                    self.position.unwrap_or(message_id),
                )
            }
            (None, None) => return Err("neither message_id nor action_type".to_string()),
        };

        Ok(Event {
            id,
            partition: chat.id,
            position,
            occurred_at,
            kind,
            sender: self.from.map(UserInfo::from),
            chat: chat.into(),
            payload: self.content,
            is_backfilled: false,
        })
    }
}

/// Decode one raw payload.
pub fn decode(raw: serde_json::Value) -> SourceItem {
    let result = serde_json::from_value::<WireEvent>(raw.clone())
        .map_err(|e| e.to_string())
        .and_then(WireEvent::into_event);

    match result {
        Ok(event) => SourceItem::Event(event),
        Err(reason) => SourceItem::Malformed { reason, raw },
    }
}

pub fn decode_all(raws: Vec<serde_json::Value>) -> Vec<SourceItem> {
    raws.into_iter().map(decode).collect()
}
