use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(BotId);
id_newtype!(ConversationKey);

/// Identity of a broadcast message, shared by every bot that observes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub source_id: String,
    pub timestamp: i64,
}

impl MessageKey {
    pub fn new(source_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.timestamp)
    }
}

/// A mention placeholder in message text. `offset` and `length` are UTF-16
/// code units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub offset: usize,
    pub length: usize,
    pub target: String,
    /// Raw label supplied by the transport, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub author: String,
}

/// One arrival of a chat message as observed by one bot's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub source_id: String,
    #[serde(default)]
    pub source_alias: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    pub conversation: ConversationKey,
    pub is_group: bool,
    pub receiving_bot: BotId,
    pub text: String,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    #[serde(default)]
    pub quote: Option<Quote>,
    pub timestamp: i64,
    #[serde(default)]
    pub is_reprocessed: bool,
}

impl InboundMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.source_id.clone(), self.timestamp)
    }

    /// Copy of this arrival re-addressed to `bot` for replay after a repair.
    pub fn reprocessed_for(&self, bot: &BotId) -> Self {
        Self {
            receiving_bot: bot.clone(),
            is_reprocessed: true,
            ..self.clone()
        }
    }
}

/// Why a bot was asked to respond. Declaration order is reporting precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseReason {
    Dm,
    Mention,
    Quote,
    Random,
}

impl ResponseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::Mention => "mention",
            Self::Quote => "quote",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for ResponseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub bot: BotId,
    pub should_respond: bool,
    pub store_in_history: bool,
    pub reason: Option<ResponseReason>,
}

impl RoutingDecision {
    pub fn respond(bot: BotId, store_in_history: bool, reason: ResponseReason) -> Self {
        Self {
            bot,
            should_respond: true,
            store_in_history,
            reason: Some(reason),
        }
    }

    pub fn silent(bot: BotId, store_in_history: bool) -> Self {
        Self {
            bot,
            should_respond: false,
            store_in_history,
            reason: None,
        }
    }
}

/// Request to wake an agent for a conversation, triggered by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub id: Uuid,
    pub bot: BotId,
    pub agent_id: String,
    pub conversation: ConversationKey,
    pub is_group: bool,
    pub message: MessageKey,
    pub reason: ResponseReason,
    pub created_at: DateTime<Utc>,
}

impl ActivationRequest {
    pub fn new(
        bot: BotId,
        agent_id: impl Into<String>,
        message: &InboundMessage,
        reason: ResponseReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            bot,
            agent_id: agent_id.into(),
            conversation: message.conversation.clone(),
            is_group: message.is_group,
            message: message.key(),
            reason,
            created_at: Utc::now(),
        }
    }
}
