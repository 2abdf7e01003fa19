//! Narrow accessor contract over the external record store.
//!
//! The router touches the store only through [`StateStore`]. The app ships a
//! SQLite implementation; [`MemoryStateStore`] backs tests and single-process
//! deployments that do not need durable history.

use crate::error::Result;
use crate::types::{ActivationRequest, BotId, ConversationKey, MessageKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub key: MessageKey,
    pub conversation: ConversationKey,
    pub source_id: String,
    pub is_group: bool,
    pub from_bot: bool,
    pub text: String,
    /// Bots whose context this message belongs to.
    pub context_bots: Vec<BotId>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub identity: String,
    pub alias: Option<String>,
    pub display_name: Option<String>,
    pub is_bot: bool,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub conversation: ConversationKey,
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn message_exists(&self, key: &MessageKey) -> Result<bool>;
    async fn record_message(&self, record: &MessageRecord) -> Result<()>;

    async fn profile_exists(&self, identity: &str) -> Result<bool>;
    async fn record_profile(&self, record: &ProfileRecord) -> Result<()>;

    async fn stream_exists(&self, conversation: &ConversationKey) -> Result<bool>;
    async fn record_stream(&self, record: &StreamRecord) -> Result<()>;

    /// Returns false when an activation for the same bot and message exists.
    async fn record_activation(&self, request: &ActivationRequest) -> Result<bool>;

    /// Bot-authored messages stored after the most recent human message.
    async fn bot_messages_since_human(&self, conversation: &ConversationKey) -> Result<usize>;

    async fn interaction_count(&self, bot: &BotId, conversation: &ConversationKey) -> Result<u32>;
    async fn set_interaction_count(
        &self,
        bot: &BotId,
        conversation: &ConversationKey,
        count: u32,
    ) -> Result<()>;
    async fn clear_interaction_counts(&self, conversation: &ConversationKey) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    messages: HashMap<MessageKey, MessageRecord>,
    history: HashMap<ConversationKey, Vec<MessageKey>>,
    profiles: HashMap<String, ProfileRecord>,
    streams: HashMap<ConversationKey, StreamRecord>,
    activations: Vec<ActivationRequest>,
    counters: HashMap<(BotId, ConversationKey), u32>,
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn activations(&self) -> Vec<ActivationRequest> {
        self.lock().activations.clone()
    }

    pub fn history(&self, conversation: &ConversationKey) -> Vec<MessageRecord> {
        let inner = self.lock();
        inner
            .history
            .get(conversation)
            .into_iter()
            .flatten()
            .filter_map(|key| inner.messages.get(key).cloned())
            .collect()
    }

    pub fn profile(&self, identity: &str) -> Option<ProfileRecord> {
        self.lock().profiles.get(identity).cloned()
    }

    pub fn stream_count(&self) -> usize {
        self.lock().streams.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn message_exists(&self, key: &MessageKey) -> Result<bool> {
        Ok(self.lock().messages.contains_key(key))
    }

    async fn record_message(&self, record: &MessageRecord) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .messages
            .insert(record.key.clone(), record.clone())
            .is_none()
        {
            inner
                .history
                .entry(record.conversation.clone())
                .or_default()
                .push(record.key.clone());
        }
        Ok(())
    }

    async fn profile_exists(&self, identity: &str) -> Result<bool> {
        Ok(self.lock().profiles.contains_key(identity))
    }

    async fn record_profile(&self, record: &ProfileRecord) -> Result<()> {
        self.lock()
            .profiles
            .entry(record.identity.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn stream_exists(&self, conversation: &ConversationKey) -> Result<bool> {
        Ok(self.lock().streams.contains_key(conversation))
    }

    async fn record_stream(&self, record: &StreamRecord) -> Result<()> {
        self.lock()
            .streams
            .entry(record.conversation.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn record_activation(&self, request: &ActivationRequest) -> Result<bool> {
        let mut inner = self.lock();
        let exists = inner
            .activations
            .iter()
            .any(|existing| existing.bot == request.bot && existing.message == request.message);
        if exists {
            return Ok(false);
        }
        inner.activations.push(request.clone());
        Ok(true)
    }

    async fn bot_messages_since_human(&self, conversation: &ConversationKey) -> Result<usize> {
        let inner = self.lock();
        let Some(keys) = inner.history.get(conversation) else {
            return Ok(0);
        };
        Ok(keys
            .iter()
            .rev()
            .map_while(|key| inner.messages.get(key).filter(|record| record.from_bot))
            .count())
    }

    async fn interaction_count(&self, bot: &BotId, conversation: &ConversationKey) -> Result<u32> {
        Ok(self
            .lock()
            .counters
            .get(&(bot.clone(), conversation.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn set_interaction_count(
        &self,
        bot: &BotId,
        conversation: &ConversationKey,
        count: u32,
    ) -> Result<()> {
        let mut inner = self.lock();
        let key = (bot.clone(), conversation.clone());
        if count == 0 {
            inner.counters.remove(&key);
        } else {
            inner.counters.insert(key, count);
        }
        Ok(())
    }

    async fn clear_interaction_counts(&self, conversation: &ConversationKey) -> Result<()> {
        self.lock()
            .counters
            .retain(|(_, scope), _| scope != conversation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InboundMessage, ResponseReason};

    fn record(ts: i64, from_bot: bool) -> MessageRecord {
        MessageRecord {
            key: MessageKey::new(if from_bot { "+1bot" } else { "+1human" }, ts),
            conversation: "group-1".into(),
            source_id: "+1".to_string(),
            is_group: true,
            from_bot,
            text: format!("message {ts}"),
            context_bots: vec![],
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn counts_trailing_bot_messages() {
        let store = MemoryStateStore::new();
        let conversation = ConversationKey::from("group-1");
        for (ts, from_bot) in [(1, true), (2, false), (3, true), (4, true)] {
            store.record_message(&record(ts, from_bot)).await.expect("record");
        }
        assert_eq!(
            store
                .bot_messages_since_human(&conversation)
                .await
                .expect("count"),
            2
        );
        store.record_message(&record(5, false)).await.expect("record");
        assert_eq!(
            store
                .bot_messages_since_human(&conversation)
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn activations_are_unique_per_bot_and_message() {
        let store = MemoryStateStore::new();
        let message = InboundMessage {
            source_id: "+1human".to_string(),
            source_alias: None,
            source_name: None,
            conversation: "group-1".into(),
            is_group: true,
            receiving_bot: "+1bot".into(),
            text: "hi".to_string(),
            mentions: vec![],
            quote: None,
            timestamp: 9,
            is_reprocessed: false,
        };
        let first = ActivationRequest::new("+1bot".into(), "agent", &message, ResponseReason::Mention);
        let again = ActivationRequest::new("+1bot".into(), "agent", &message, ResponseReason::Mention);
        assert!(store.record_activation(&first).await.expect("first"));
        assert!(!store.record_activation(&again).await.expect("again"));
        assert_eq!(store.activations().len(), 1);
    }

    #[tokio::test]
    async fn clearing_counters_is_scoped_to_conversation() {
        let store = MemoryStateStore::new();
        let bot = BotId::from("+1bot");
        let a = ConversationKey::from("a");
        let b = ConversationKey::from("b");
        store.set_interaction_count(&bot, &a, 3).await.expect("set");
        store.set_interaction_count(&bot, &b, 2).await.expect("set");
        store.clear_interaction_counts(&a).await.expect("clear");
        assert_eq!(store.interaction_count(&bot, &a).await.expect("get"), 0);
        assert_eq!(store.interaction_count(&bot, &b).await.expect("get"), 2);
    }
}
