use anyhow::Result;
use async_trait::async_trait;
use mb_core::{BotId, ConversationKey, Mention};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Direct(String),
    /// Group id as the transport addresses it.
    Group(String),
}

impl Recipient {
    pub fn for_conversation(conversation: &ConversationKey, is_group: bool) -> Self {
        if is_group {
            Self::Group(conversation.to_string())
        } else {
            Self::Direct(conversation.to_string())
        }
    }

    /// Accepts a phone number/uuid or `group:<group_id>`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.strip_prefix("group:").map(str::trim) {
            Some("") => None,
            Some(group_id) => Some(Self::Group(group_id.to_string())),
            None => Some(Self::Direct(raw.to_string())),
        }
    }
}

/// Mention in the wire shape the REST gateway expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMention {
    pub author: String,
    pub start: usize,
    pub length: usize,
}

impl From<&Mention> for OutboundMention {
    fn from(mention: &Mention) -> Self {
        Self {
            author: mention.target.clone(),
            start: mention.offset,
            length: mention.length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSend {
    pub recipient: Recipient,
    pub message: String,
    pub mentions: Vec<OutboundMention>,
}

#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Sends one message from `bot`'s account.
    async fn send(&self, bot: &BotId, request: &SignalSend) -> Result<()>;

    /// Maps a group id seen on inbound envelopes to the id used for sending.
    async fn resolve_group(&self, bot: &BotId, group_id: &str) -> Result<String>;
}
