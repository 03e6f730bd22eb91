//! Event filtering: which chats and message classes are in scope.

use ingest_core::{Event, PartitionId};
use std::collections::HashSet;

use crate::config::FilterConfig;

/// Outcome of [`EventFilter::evaluate`], naming the rule that rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    IgnoredChat,
    NotAllowedChat,
    BotMessage,
    SystemMessage,
    ChannelMessage,
    IgnoredChannel,
    NotAllowedChannel,
}

impl FilterDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Accept => "accepted",
            Self::IgnoredChat => "chat_ignored",
            Self::NotAllowedChat => "chat_not_allowed",
            Self::BotMessage => "bot_message",
            Self::SystemMessage => "system_message",
            Self::ChannelMessage => "channel_message",
            Self::IgnoredChannel => "channel_ignored",
            Self::NotAllowedChannel => "channel_not_allowed",
        }
    }
}

/// Pure predicate over events. Rules short-circuit in order.
#[derive(Debug, Clone)]
pub struct EventFilter {
    allowed_chats: HashSet<PartitionId>,
    ignored_chats: HashSet<PartitionId>,
    allowed_channels: HashSet<String>,
    ignored_channels: HashSet<String>,
    process_bot_messages: bool,
    process_system_messages: bool,
    process_channel_messages: bool,
}

fn normalize_channel(name: &str) -> String {
    name.trim().trim_start_matches('@').to_lowercase()
}

impl EventFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            allowed_chats: config.allowed_chats.iter().copied().collect(),
            ignored_chats: config.ignored_chats.iter().copied().collect(),
            allowed_channels: config
                .allowed_channels
                .iter()
                .map(|c| normalize_channel(c))
                .filter(|c| !c.is_empty())
                .collect(),
            ignored_channels: config
                .ignored_channels
                .iter()
                .map(|c| normalize_channel(c))
                .filter(|c| !c.is_empty())
                .collect(),
            process_bot_messages: config.process_bot_messages,
            process_system_messages: config.process_system_messages,
            process_channel_messages: config.process_channel_messages,
        }
    }

    /// Chat-level rules only. An empty allow-list means no restriction.
    fn partition_decision(&self, partition: PartitionId) -> FilterDecision {
        if self.ignored_chats.contains(&partition) {
            return FilterDecision::IgnoredChat;
        }
        if !self.allowed_chats.is_empty() && !self.allowed_chats.contains(&partition) {
            return FilterDecision::NotAllowedChat;
        }
        FilterDecision::Accept
    }

    pub fn evaluate(&self, event: &Event) -> FilterDecision {
        let decision = self.partition_decision(event.partition);
        if !decision.is_accepted() {
            return decision;
        }

        if !self.process_bot_messages && event.is_from_bot() {
            return FilterDecision::BotMessage;
        }
        if !self.process_system_messages && event.is_system() {
            return FilterDecision::SystemMessage;
        }

        if event.chat.is_channel() {
            if !self.process_channel_messages {
                return FilterDecision::ChannelMessage;
            }
            if let Some(username) = event.chat.username.as_deref() {
                let username = normalize_channel(username);
                if self.ignored_channels.contains(&username) {
                    return FilterDecision::IgnoredChannel;
                }
                if !self.allowed_channels.is_empty() && !self.allowed_channels.contains(&username)
                {
                    return FilterDecision::NotAllowedChannel;
                }
            }
        }

        FilterDecision::Accept
    }

    pub fn accepts(&self, event: &Event) -> bool {
        self.evaluate(event).is_accepted()
    }

    /// Whether a partition is in scope at all, used to pick backfill targets.
    pub fn accepts_partition(&self, partition: PartitionId) -> bool {
        self.partition_decision(partition).is_accepted()
    }
}
