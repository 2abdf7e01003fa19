//! Per-bot connection lifecycle with capped exponential backoff.
//!
//! [`ReconnectManager::supervise`] owns one bot's feed: it runs the connection,
//! backs off after drops, and gives up once a retry sequence has lasted longer
//! than the policy window. The manager doubles as the consistency checker's
//! [`Reconnector`]: repair payloads are parked per bot and handed to the replay
//! queue, marked as reprocessed, the next time that bot's feed reports ready.

use crate::consistency::Reconnector;
use crate::error::{CoreError, Result};
use crate::types::{BotId, InboundMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_window: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_window: DEFAULT_MAX_WINDOW,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^retry_count, max)`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let multiplier = 1_u32 << retry_count.min(20);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry window exhausted; needs operator intervention.
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    pub retry_count: u32,
    pub first_attempt_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    Retry { delay: Duration, attempt: u32 },
    GiveUp { elapsed: Duration },
}

impl ReconnectState {
    pub fn next_step(&mut self, policy: &ReconnectPolicy, now: Instant) -> ReconnectStep {
        let first = *self.first_attempt_at.get_or_insert(now);
        let elapsed = now.duration_since(first);
        if elapsed >= policy.max_window {
            self.reset();
            return ReconnectStep::GiveUp { elapsed };
        }
        let delay = policy.backoff_delay(self.retry_count);
        self.retry_count += 1;
        ReconnectStep::Retry {
            delay,
            attempt: self.retry_count,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

struct BotLink {
    state: ConnectionState,
    retry: ReconnectState,
    pending: Vec<InboundMessage>,
    restart: Arc<Notify>,
}

impl BotLink {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry: ReconnectState::default(),
            pending: Vec::new(),
            restart: Arc::new(Notify::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkSnapshot {
    pub bot: BotId,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub pending_replays: usize,
}

/// One bot's transport feed.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Runs a single connection until it closes or fails. Implementations call
    /// [`ReadySignal::mark_ready`] once the connection is live.
    async fn run_connection(&self, bot: &BotId, ready: ReadySignal) -> Result<()>;
}

pub struct ReadySignal {
    manager: Arc<ReconnectManager>,
    bot: BotId,
}

impl ReadySignal {
    pub async fn mark_ready(self) {
        self.manager.mark_connected(&self.bot).await;
    }
}

pub struct ReconnectManager {
    policy: ReconnectPolicy,
    links: DashMap<BotId, BotLink>,
    replay_tx: mpsc::Sender<InboundMessage>,
}

impl ReconnectManager {
    pub fn new(policy: ReconnectPolicy, replay_tx: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            policy,
            links: DashMap::new(),
            replay_tx,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn register(&self, bot: &BotId) {
        self.links.entry(bot.clone()).or_insert_with(BotLink::new);
    }

    pub fn state(&self, bot: &BotId) -> Option<ConnectionState> {
        self.links.get(bot).map(|link| link.state)
    }

    fn set_state(&self, bot: &BotId, state: ConnectionState) {
        if let Some(mut link) = self.links.get_mut(bot) {
            link.state = state;
        }
    }

    fn restart_handle(&self, bot: &BotId) -> Arc<Notify> {
        self.links
            .entry(bot.clone())
            .or_insert_with(BotLink::new)
            .restart
            .clone()
    }

    /// Records a dropped connection and decides what happens next.
    pub fn on_disconnected(&self, bot: &BotId, now: Instant) -> ReconnectStep {
        let mut link = self.links.entry(bot.clone()).or_insert_with(BotLink::new);
        let step = link.retry.next_step(&self.policy, now);
        match step {
            ReconnectStep::Retry { .. } => link.state = ConnectionState::Disconnected,
            ReconnectStep::GiveUp { .. } => {
                link.state = ConnectionState::Failed;
                let dropped = std::mem::take(&mut link.pending);
                if !dropped.is_empty() {
                    tracing::warn!(
                        bot_id = %bot,
                        dropped = dropped.len(),
                        "discarding queued replays for failed connection"
                    );
                }
            }
        }
        step
    }

    /// Clean connection: clears the retry sequence and replays parked payloads.
    pub async fn mark_connected(&self, bot: &BotId) {
        let pending = {
            let mut link = self.links.entry(bot.clone()).or_insert_with(BotLink::new);
            link.state = ConnectionState::Connected;
            link.retry.reset();
            std::mem::take(&mut link.pending)
        };
        tracing::info!(bot_id = %bot, replays = pending.len(), "bot connection established");

        for message in pending {
            let replay = message.reprocessed_for(bot);
            if self.replay_tx.send(replay).await.is_err() {
                tracing::warn!(bot_id = %bot, "replay queue closed; dropping repaired message");
                return;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let mut links: Vec<LinkSnapshot> = self
            .links
            .iter()
            .map(|entry| LinkSnapshot {
                bot: entry.key().clone(),
                state: entry.state,
                retry_count: entry.retry.retry_count,
                pending_replays: entry.pending.len(),
            })
            .collect();
        links.sort_by(|a, b| a.bot.cmp(&b.bot));
        links
    }

    /// Keeps one bot's feed alive until `cancel` fires or the retry window is
    /// exhausted.
    #[tracing::instrument(level = "info", skip_all, fields(bot_id = %bot))]
    pub async fn supervise(
        self: Arc<Self>,
        bot: BotId,
        connector: Arc<dyn FeedConnector>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let restart = self.restart_handle(&bot);
        loop {
            self.set_state(&bot, ConnectionState::Connecting);
            let ready = ReadySignal {
                manager: Arc::clone(&self),
                bot: bot.clone(),
            };

            let outcome = tokio::select! {
                () = cancel.cancelled() => {
                    self.set_state(&bot, ConnectionState::Disconnected);
                    return Ok(());
                }
                () = restart.notified() => {
                    tracing::info!("forced reconnect for consistency repair");
                    continue;
                }
                result = connector.run_connection(&bot, ready) => result,
            };

            match outcome {
                Ok(()) => tracing::info!("bot connection closed"),
                Err(e) => tracing::warn!(error = %e, "bot connection failed"),
            }

            match self.on_disconnected(&bot, Instant::now()) {
                ReconnectStep::Retry { delay, attempt } => {
                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                ReconnectStep::GiveUp { elapsed } => {
                    tracing::error!(
                        elapsed_secs = elapsed.as_secs(),
                        "reconnect window exhausted; giving up on bot connection"
                    );
                    return Err(CoreError::ReconnectExhausted {
                        bot_id: bot,
                        elapsed,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Reconnector for ReconnectManager {
    async fn reconnect(&self, bot: &BotId, payload: Option<InboundMessage>) -> Result<()> {
        let Some(mut link) = self.links.get_mut(bot) else {
            return Err(CoreError::UnknownBot(bot.to_string()));
        };
        if link.state == ConnectionState::Failed {
            return Err(CoreError::Connection(format!(
                "connection for {bot} has given up"
            )));
        }
        if let Some(payload) = payload {
            link.pending.push(payload);
        }
        // Otherwise the payload is flushed when the in-flight attempt connects.
        if link.state == ConnectionState::Connected {
            link.restart.notify_one();
        }
        Ok(())
    }
}
