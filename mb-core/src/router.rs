//! Response routing: decides, per bot, whether an inbound message is kept in
//! history and whether the bot should be asked to respond.
//!
//! Every bot connection feeds its arrivals through [`ResponseRouter::route`].
//! Only the canonical arrival (see [`Deduplicator`]) evaluates the roster and
//! performs side effects; the rest return [`RoutingOutcome::Duplicate`].

use crate::dedup::Deduplicator;
use crate::error::Result;
use crate::interaction::{DEFAULT_BOT_TO_BOT_LIMIT, InteractionCounters};
use crate::mentions::{IdentityDirectory, ProfileCache, decode_mentions};
use crate::roster::{BotProfile, BotRoster};
use crate::store::{MessageRecord, ProfileRecord, StateStore, StreamRecord};
use crate::types::{
    ActivationRequest, BotId, ConversationKey, InboundMessage, MessageKey, ResponseReason,
    RoutingDecision,
};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Leading marker a sender uses to flip a group message's history policy.
pub const ESCAPE_MARKER: char = '.';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrivacyMode {
    /// Group messages enter history only when marked or addressed to a bot.
    #[default]
    OptIn,
    /// Group messages enter history unless marked.
    OptOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingSettings {
    pub privacy_mode: PrivacyMode,
    /// "1-in-N" chance of an unprompted reply; 0 disables.
    pub random_reply_rate: u32,
    pub bot_to_bot_limit: u32,
    pub max_bot_responses: Option<usize>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            privacy_mode: PrivacyMode::OptIn,
            random_reply_rate: 0,
            bot_to_bot_limit: DEFAULT_BOT_TO_BOT_LIMIT,
            max_bot_responses: None,
        }
    }
}

pub trait RandomSource: Send + Sync {
    /// True with probability 1/n.
    fn one_in(&self, n: u32) -> bool;
}

#[derive(Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn one_in(&self, n: u32) -> bool {
        n > 0 && rand::rng().random_range(1..=n) == 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// Malformed arrival; nothing happened.
    Dropped { reason: &'static str },
    /// Another bot's arrival already claimed canonical processing.
    Duplicate {
        key: MessageKey,
        first_receiver: Option<BotId>,
    },
    /// Sender opted the message out of history; no bot sees it.
    Excluded { key: MessageKey },
    Routed(RoutedMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub key: MessageKey,
    pub conversation: ConversationKey,
    pub from_bot: bool,
    pub history_text: String,
    pub stored: bool,
    pub decisions: Vec<RoutingDecision>,
    pub activations: Vec<ActivationRequest>,
}

/// Per-message facts shared by every candidate evaluation.
struct MessageContext<'a> {
    message: &'a InboundMessage,
    from_bot: bool,
    marked: bool,
    cap_reached: bool,
}

pub struct ResponseRouter {
    roster: Arc<BotRoster>,
    profiles: Arc<ProfileCache>,
    dedup: Arc<Deduplicator>,
    counters: Arc<InteractionCounters>,
    store: Arc<dyn StateStore>,
    settings: RoutingSettings,
    random: Arc<dyn RandomSource>,
}

impl ResponseRouter {
    pub fn new(
        roster: Arc<BotRoster>,
        profiles: Arc<ProfileCache>,
        dedup: Arc<Deduplicator>,
        counters: Arc<InteractionCounters>,
        store: Arc<dyn StateStore>,
        settings: RoutingSettings,
    ) -> Self {
        Self {
            roster,
            profiles,
            dedup,
            counters,
            store,
            settings,
            random: Arc::new(ThreadRandom),
        }
    }

    pub fn with_random_source(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn settings(&self) -> &RoutingSettings {
        &self.settings
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(bot_id = %message.receiving_bot, message_key = %message.key())
    )]
    pub async fn route(&self, message: &InboundMessage) -> Result<RoutingOutcome> {
        if let Some(reason) = self.malformed(message) {
            tracing::warn!(reason, "dropping malformed inbound message");
            return Ok(RoutingOutcome::Dropped { reason });
        }

        let key = message.key();
        if !self.dedup.should_process(
            &key,
            &message.receiving_bot,
            message.is_group,
            message.is_reprocessed,
        ) {
            let first_receiver = self.dedup.first_receiver(&key);
            return Ok(RoutingOutcome::Duplicate {
                key,
                first_receiver,
            });
        }

        let from_bot = self.is_bot_originated(message);
        let decoded = decode_mentions(
            &message.text,
            &message.mentions,
            &[&*self.roster as &dyn IdentityDirectory, &*self.profiles],
        );
        let stripped = if message.is_group {
            strip_escape_marker(&decoded).map(str::to_string)
        } else {
            None
        };
        let marked = stripped.is_some();
        let history_text = stripped.unwrap_or(decoded);

        if marked && self.settings.privacy_mode == PrivacyMode::OptOut {
            tracing::info!(
                conversation = %message.conversation,
                "sender excluded message from history; no bot will respond"
            );
            return Ok(RoutingOutcome::Excluded { key });
        }

        if !from_bot && !message.is_reprocessed {
            self.counters.reset(&message.conversation).await?;
        }

        let cap_reached = match self.settings.max_bot_responses {
            Some(max) if message.is_group => {
                self.store
                    .bot_messages_since_human(&message.conversation)
                    .await?
                    >= max
            }
            _ => false,
        };

        let context = MessageContext {
            message,
            from_bot,
            marked,
            cap_reached,
        };
        let mut decisions = Vec::new();
        for bot in self.candidates(message) {
            decisions.push(self.decide(&context, bot).await?);
        }

        let stored = decisions.iter().any(|decision| decision.store_in_history);
        let activations = self
            .apply_side_effects(&context, &history_text, stored, &decisions)
            .await?;

        Ok(RoutingOutcome::Routed(RoutedMessage {
            key,
            conversation: message.conversation.clone(),
            from_bot,
            history_text,
            stored,
            decisions,
            activations,
        }))
    }

    fn malformed(&self, message: &InboundMessage) -> Option<&'static str> {
        if message.source_id.trim().is_empty() {
            return Some("missing sender");
        }
        if message.conversation.trim().is_empty() {
            return Some("missing conversation");
        }
        if message.text.trim().is_empty() && message.mentions.is_empty() {
            return Some("missing text");
        }
        if self.roster.get(&message.receiving_bot).is_none() {
            return Some("unknown receiving bot");
        }
        None
    }

    fn is_bot_originated(&self, message: &InboundMessage) -> bool {
        self.roster.is_bot(&message.source_id)
            || message
                .source_alias
                .as_deref()
                .is_some_and(|alias| self.roster.is_bot(alias))
    }

    /// DMs and replays concern only the receiving bot; group messages are
    /// evaluated against the whole roster.
    fn candidates<'a>(&'a self, message: &InboundMessage) -> Vec<&'a BotProfile> {
        if !message.is_group || message.is_reprocessed {
            return self.roster.get(&message.receiving_bot).into_iter().collect();
        }
        self.roster.bots().iter().collect()
    }

    async fn decide(&self, context: &MessageContext<'_>, bot: &BotProfile) -> Result<RoutingDecision> {
        let message = context.message;
        let bot_id = bot.id();

        let mentioned = message
            .mentions
            .iter()
            .any(|mention| bot.has_identity(&mention.target));
        let quoted = message
            .quote
            .as_ref()
            .is_some_and(|quote| bot.has_identity(&quote.author));
        let targeted = mentioned || quoted;

        let store = if !message.is_group {
            true
        } else {
            match self.settings.privacy_mode {
                PrivacyMode::OptIn => context.marked || targeted,
                PrivacyMode::OptOut => true,
            }
        };

        let is_self = bot.has_identity(&message.source_id)
            || message
                .source_alias
                .as_deref()
                .is_some_and(|alias| bot.has_identity(alias));
        if is_self {
            tracing::debug!(bot_id = %bot_id, "message authored by this bot; not responding");
            return Ok(RoutingDecision::silent(bot_id, store));
        }

        let direct_reason = if !message.is_group {
            Some(ResponseReason::Dm)
        } else if mentioned {
            Some(ResponseReason::Mention)
        } else if quoted {
            Some(ResponseReason::Quote)
        } else {
            None
        };

        if context.from_bot
            && (direct_reason.is_some() || self.random_reply_possible(context, store))
            && !self
                .counters
                .check(&bot_id, &message.conversation)
                .await?
                .is_granted()
        {
            tracing::info!(
                bot_id = %bot_id,
                conversation = %message.conversation,
                limit = self.counters.limit(),
                "bot-to-bot interaction limit reached; refusing"
            );
            return Ok(RoutingDecision::silent(bot_id, store));
        }

        if let Some(reason) = direct_reason {
            return Ok(RoutingDecision::respond(bot_id, store, reason));
        }

        if !self.random_reply_possible(context, store) {
            return Ok(RoutingDecision::silent(bot_id, store));
        }
        if context.cap_reached {
            tracing::debug!(
                bot_id = %bot_id,
                conversation = %message.conversation,
                "response cap reached; random reply suppressed"
            );
            return Ok(RoutingDecision::silent(bot_id, store));
        }
        if self.random.one_in(self.settings.random_reply_rate) {
            return Ok(RoutingDecision::respond(bot_id, store, ResponseReason::Random));
        }
        Ok(RoutingDecision::silent(bot_id, store))
    }

    fn random_reply_possible(&self, context: &MessageContext<'_>, store: bool) -> bool {
        context.message.is_group && store && self.settings.random_reply_rate > 0
    }

    async fn apply_side_effects(
        &self,
        context: &MessageContext<'_>,
        history_text: &str,
        stored: bool,
        decisions: &[RoutingDecision],
    ) -> Result<Vec<ActivationRequest>> {
        let message = context.message;
        self.record_sender(message, context.from_bot).await?;

        if !self.store.stream_exists(&message.conversation).await? {
            self.store
                .record_stream(&StreamRecord {
                    conversation: message.conversation.clone(),
                    is_group: message.is_group,
                    created_at: Utc::now(),
                })
                .await?;
        }

        let key = message.key();
        if stored && !self.store.message_exists(&key).await? {
            self.store
                .record_message(&MessageRecord {
                    key: key.clone(),
                    conversation: message.conversation.clone(),
                    source_id: message.source_id.clone(),
                    is_group: message.is_group,
                    from_bot: context.from_bot,
                    text: history_text.to_string(),
                    context_bots: decisions
                        .iter()
                        .filter(|decision| decision.store_in_history)
                        .map(|decision| decision.bot.clone())
                        .collect(),
                    recorded_at: Utc::now(),
                })
                .await?;
        }

        let mut activations = Vec::new();
        for decision in decisions.iter().filter(|decision| decision.should_respond) {
            let (Some(reason), Some(profile)) = (decision.reason, self.roster.get(&decision.bot))
            else {
                continue;
            };
            if context.from_bot
                && !self
                    .counters
                    .try_acquire(&decision.bot, &message.conversation)
                    .await?
                    .is_granted()
            {
                continue;
            }

            let request = ActivationRequest::new(
                decision.bot.clone(),
                profile.agent_id.clone(),
                message,
                reason,
            );
            if self.store.record_activation(&request).await? {
                tracing::info!(
                    bot_id = %request.bot,
                    agent_id = %request.agent_id,
                    conversation = %request.conversation,
                    message_key = %request.message,
                    reason = %reason,
                    "activation requested"
                );
                activations.push(request);
            } else {
                tracing::debug!(
                    bot_id = %decision.bot,
                    message_key = %key,
                    "activation already recorded for this message"
                );
                if context.from_bot {
                    self.counters
                        .release(&decision.bot, &message.conversation)
                        .await?;
                }
            }
        }
        Ok(activations)
    }

    async fn record_sender(&self, message: &InboundMessage, from_bot: bool) -> Result<()> {
        if !from_bot {
            self.profiles.remember_sender(message);
        }
        if self.store.profile_exists(&message.source_id).await? {
            return Ok(());
        }
        self.store
            .record_profile(&ProfileRecord {
                identity: message.source_id.clone(),
                alias: message.source_alias.clone(),
                display_name: message.source_name.clone(),
                is_bot: from_bot,
                first_seen: Utc::now(),
            })
            .await
    }
}

/// Text after a leading "." marker, trimmed; `None` when unmarked. A run of
/// dots ("...") is ordinary punctuation, not a marker.
pub fn strip_escape_marker(text: &str) -> Option<&str> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix(ESCAPE_MARKER)?;
    if rest.starts_with(ESCAPE_MARKER) {
        return None;
    }
    Some(rest.trim())
}
