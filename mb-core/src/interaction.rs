//! Bot-to-bot loop prevention counters.
//!
//! A counter per (bot, conversation) tracks how many consecutive
//! bot-originated turns the bot has answered since the last human message.

use crate::error::Result;
use crate::store::StateStore;
use crate::types::{BotId, ConversationKey};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_BOT_TO_BOT_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionGrant {
    Granted { count: u32 },
    Refused { count: u32 },
}

impl InteractionGrant {
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

pub struct InteractionCounters {
    store: Arc<dyn StateStore>,
    limit: u32,
    // Serializes read-modify-write cycles against the store.
    guard: Mutex<()>,
}

impl InteractionCounters {
    pub fn new(store: Arc<dyn StateStore>, limit: u32) -> Self {
        Self {
            store,
            limit,
            guard: Mutex::new(()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub async fn count(&self, bot: &BotId, conversation: &ConversationKey) -> Result<u32> {
        self.store.interaction_count(bot, conversation).await
    }

    /// Checks the limit without consuming a turn.
    pub async fn check(&self, bot: &BotId, conversation: &ConversationKey) -> Result<InteractionGrant> {
        let count = self.count(bot, conversation).await?;
        Ok(self.grant_for(count))
    }

    /// Checks the limit and, when below it, records one more answered turn.
    pub async fn try_acquire(
        &self,
        bot: &BotId,
        conversation: &ConversationKey,
    ) -> Result<InteractionGrant> {
        let _held = self.guard.lock().await;
        let count = self.store.interaction_count(bot, conversation).await?;
        if count >= self.limit {
            tracing::info!(
                bot_id = %bot,
                conversation = %conversation,
                count,
                limit = self.limit,
                "bot-to-bot limit reached; refusing response"
            );
            return Ok(InteractionGrant::Refused { count });
        }
        let next = count + 1;
        self.store
            .set_interaction_count(bot, conversation, next)
            .await?;
        Ok(InteractionGrant::Granted { count: next })
    }

    /// Gives back a turn taken by [`Self::try_acquire`] that was not used.
    pub async fn release(&self, bot: &BotId, conversation: &ConversationKey) -> Result<()> {
        let _held = self.guard.lock().await;
        let count = self.store.interaction_count(bot, conversation).await?;
        self.store
            .set_interaction_count(bot, conversation, count.saturating_sub(1))
            .await
    }

    /// A human spoke: every bot's counter for the conversation starts over.
    pub async fn reset(&self, conversation: &ConversationKey) -> Result<()> {
        let _held = self.guard.lock().await;
        self.store.clear_interaction_counts(conversation).await
    }

    fn grant_for(&self, count: u32) -> InteractionGrant {
        if count >= self.limit {
            InteractionGrant::Refused { count }
        } else {
            InteractionGrant::Granted { count }
        }
    }
}
