//! Event model shared by the source, pipeline, and store.
//!
//! An [`Event`] is one logged occurrence in a chat: either a message or an
//! action (member join, pin, title change, ...). Its free-form content is
//! carried as a [`serde_json::Value`] and never interpreted by the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::descriptors::{ChatInfo, UserInfo};

/// Partition key: the chat the event belongs to.
pub type PartitionId = i64;

/// Natural identifier of an event, unique within its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EventId {
    Message(i64),
    Action(Uuid),
}

/// Namespace for action ids derived from their natural key.
const ACTION_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_39a2_8d47_5e0b_9b3c_2f6e_a4d1_7c58);

impl EventId {
    /// Stable id for an action the source delivered without one.
    ///
    /// The same (chat, position, action type) always yields the same id, so
    /// redeliveries upsert onto one row.
    pub fn derived_action(partition: PartitionId, position: i64, action_type: &str) -> Self {
        let name = format!("{}:{}:{}", partition, position, action_type);
        Self::Action(Uuid::new_v5(&ACTION_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(id) => write!(f, "message:{}", id),
            Self::Action(id) => write!(f, "action:{}", id),
        }
    }
}

/// Message content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Audio,
    Document,
    Animation,
    Photo,
    Sticker,
    Video,
    VideoNote,
    Voice,
    Contact,
    Dice,
    Game,
    Poll,
    Venue,
    Location,
    Invoice,
    SuccessfulPayment,
    WebAppData,
    Forwarded,
    Reply,
    Service,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Animation => "animation",
            Self::Photo => "photo",
            Self::Sticker => "sticker",
            Self::Video => "video",
            Self::VideoNote => "video_note",
            Self::Voice => "voice",
            Self::Contact => "contact",
            Self::Dice => "dice",
            Self::Game => "game",
            Self::Poll => "poll",
            Self::Venue => "venue",
            Self::Location => "location",
            Self::Invoice => "invoice",
            Self::SuccessfulPayment => "successful_payment",
            Self::WebAppData => "web_app_data",
            Self::Forwarded => "forwarded",
            Self::Reply => "reply",
            Self::Service => "service",
        }
    }
}

/// Side-effect action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    MessageDelete,
    MessageEdit,
    MessagePin,
    MessageUnpin,
    MemberJoin,
    MemberLeave,
    MemberUpdate,
    MemberBan,
    MemberUnban,
    ChatCreate,
    ChatDelete,
    ChatUpdate,
    ChatMigrate,
    VideoChatStarted,
    VideoChatEnded,
    VideoChatParticipantsInvited,
    VideoChatScheduled,
    InviteLinkCreate,
    InviteLinkRevoke,
    PollCreate,
    PollVote,
    #[serde(other)]
    Other,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageDelete => "message_delete",
            Self::MessageEdit => "message_edit",
            Self::MessagePin => "message_pin",
            Self::MessageUnpin => "message_unpin",
            Self::MemberJoin => "member_join",
            Self::MemberLeave => "member_leave",
            Self::MemberUpdate => "member_update",
            Self::MemberBan => "member_ban",
            Self::MemberUnban => "member_unban",
            Self::ChatCreate => "chat_create",
            Self::ChatDelete => "chat_delete",
            Self::ChatUpdate => "chat_update",
            Self::ChatMigrate => "chat_migrate",
            Self::VideoChatStarted => "video_chat_started",
            Self::VideoChatEnded => "video_chat_ended",
            Self::VideoChatParticipantsInvited => "video_chat_participants_invited",
            Self::VideoChatScheduled => "video_chat_scheduled",
            Self::InviteLinkCreate => "invite_link_create",
            Self::InviteLinkRevoke => "invite_link_revoke",
            Self::PollCreate => "poll_create",
            Self::PollVote => "poll_vote",
            Self::Other => "other",
        }
    }
}

/// What kind of occurrence an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "subtype", rename_all = "snake_case")]
pub enum EventKind {
    Message(MessageType),
    Action(ActionType),
}

/// One logged occurrence in a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub partition: PartitionId,
    /// Ordering position within the partition (message sequence number).
    /// Actions carry the position of the service message that produced them.
    pub position: i64,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
    pub sender: Option<UserInfo>,
    pub chat: ChatInfo,
    /// Free-form content: text, entities, attachments, media metadata.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub is_backfilled: bool,
}

impl Event {
    /// Storage uniqueness key.
    pub fn key(&self) -> (EventId, PartitionId) {
        (self.id, self.partition)
    }

    pub fn is_from_bot(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| s.is_bot)
    }

    /// Service notifications: every action plus service-typed messages.
    pub fn is_system(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Action(_) | EventKind::Message(MessageType::Service)
        )
    }

    pub fn is_message(&self) -> bool {
        matches!(self.kind, EventKind::Message(_))
    }

    /// Mark this event as retrieved by a backfill walk.
    pub fn backfilled(mut self) -> Self {
        self.is_backfilled = true;
        self
    }
}
