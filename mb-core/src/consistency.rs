//! Fan-in tracking for broadcast group messages.
//!
//! Each group message should reach every bot connection. The checker collects
//! arrivals for a short window, then asks the [`Reconnector`] to repair any bot
//! that was mentioned or quoted but never reported the message. Untargeted
//! misses are only logged.

use crate::error::Result;
use crate::roster::BotRoster;
use crate::types::{BotId, InboundMessage, MessageKey};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONSISTENCY_WINDOW: Duration = Duration::from_secs(2);
/// How long an evaluated message id is remembered so stragglers cannot
/// re-open it.
const EVALUATED_RETENTION: Duration = Duration::from_secs(60);

/// Restores a bot's connection and queues `payload` for replay once it is up.
#[async_trait]
pub trait Reconnector: Send + Sync {
    async fn reconnect(&self, bot: &BotId, payload: Option<InboundMessage>) -> Result<()>;
}

struct Tracker {
    received_by: HashSet<BotId>,
    payload: InboundMessage,
    is_bot_message: bool,
    cancel: CancellationToken,
}

#[derive(Default)]
struct CheckerState {
    trackers: HashMap<MessageKey, Tracker>,
    evaluated: HashMap<MessageKey, Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub key: MessageKey,
    pub received: Vec<BotId>,
    pub missing: Vec<BotId>,
    pub targeted_missing: Vec<BotId>,
    pub is_bot_message: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsistencyStats {
    pub pending: usize,
    pub evaluated: u64,
    pub repairs_requested: u64,
}

pub struct ConsistencyChecker {
    roster: Arc<BotRoster>,
    reconnector: Arc<dyn Reconnector>,
    window: Duration,
    state: Mutex<CheckerState>,
    evaluated: AtomicU64,
    repairs_requested: AtomicU64,
}

impl ConsistencyChecker {
    pub fn new(roster: Arc<BotRoster>, reconnector: Arc<dyn Reconnector>, window: Duration) -> Self {
        Self {
            roster,
            reconnector,
            window,
            state: Mutex::new(CheckerState::default()),
            evaluated: AtomicU64::new(0),
            repairs_requested: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CheckerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that `message.receiving_bot` saw the message. Must be called for
    /// every raw arrival, before deduplication.
    pub fn record_arrival(self: &Arc<Self>, message: &InboundMessage) {
        if !message.is_group || message.is_reprocessed {
            return;
        }

        let key = message.key();
        let mut state = self.lock();
        let now = Instant::now();
        state
            .evaluated
            .retain(|_, at| now.duration_since(*at) < EVALUATED_RETENTION);
        if state.evaluated.contains_key(&key) {
            tracing::debug!(
                message_key = %key,
                bot_id = %message.receiving_bot,
                "arrival after consistency window closed; ignoring"
            );
            return;
        }

        if let Some(tracker) = state.trackers.get_mut(&key) {
            tracker.received_by.insert(message.receiving_bot.clone());
            return;
        }

        let cancel = CancellationToken::new();
        state.trackers.insert(
            key.clone(),
            Tracker {
                received_by: HashSet::from([message.receiving_bot.clone()]),
                payload: message.clone(),
                is_bot_message: self.roster.is_bot(&message.source_id),
                cancel: cancel.clone(),
            },
        );
        drop(state);

        let checker = Arc::clone(self);
        let window = self.window;
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(window) => {
                    checker.evaluate(&key).await;
                }
            }
        });
    }

    /// Closes the tracker for `key` and repairs targeted bots that missed it.
    /// Returns `None` when the key was already evaluated or never tracked.
    pub async fn evaluate(&self, key: &MessageKey) -> Option<ConsistencyReport> {
        let tracker = {
            let mut state = self.lock();
            let tracker = state.trackers.remove(key)?;
            state.evaluated.insert(key.clone(), Instant::now());
            tracker
        };
        tracker.cancel.cancel();
        self.evaluated.fetch_add(1, Ordering::Relaxed);

        let (received, missing): (Vec<BotId>, Vec<BotId>) = self
            .roster
            .bot_ids()
            .into_iter()
            .partition(|bot| tracker.received_by.contains(bot));
        let targeted = self.targeted_bots(&tracker.payload);
        let targeted_missing: Vec<BotId> = missing
            .iter()
            .filter(|bot| targeted.contains(*bot))
            .cloned()
            .collect();

        tracing::info!(
            message_key = %key,
            received = received.len(),
            missing = missing.len(),
            targeted_missing = targeted_missing.len(),
            repair = ?targeted_missing,
            is_bot_message = tracker.is_bot_message,
            "consistency check complete"
        );
        if targeted_missing.len() < missing.len() {
            tracing::debug!(
                message_key = %key,
                missing = ?missing,
                "untargeted bots missed message; no repair needed"
            );
        }

        for bot in &targeted_missing {
            self.repairs_requested.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self
                .reconnector
                .reconnect(bot, Some(tracker.payload.clone()))
                .await
            {
                tracing::warn!(
                    message_key = %key,
                    bot_id = %bot,
                    error = %e,
                    "reconnect for consistency repair failed"
                );
            }
        }

        Some(ConsistencyReport {
            key: key.clone(),
            received,
            missing,
            targeted_missing,
            is_bot_message: tracker.is_bot_message,
        })
    }

    fn targeted_bots(&self, message: &InboundMessage) -> HashSet<BotId> {
        message
            .mentions
            .iter()
            .map(|mention| mention.target.as_str())
            .chain(message.quote.iter().map(|quote| quote.author.as_str()))
            .filter_map(|identity| self.roster.resolve(identity))
            .map(|profile| profile.id())
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.lock().trackers.len()
    }

    pub fn stats(&self) -> ConsistencyStats {
        ConsistencyStats {
            pending: self.pending(),
            evaluated: self.evaluated.load(Ordering::Relaxed),
            repairs_requested: self.repairs_requested.load(Ordering::Relaxed),
        }
    }

    /// Cancels every pending timer without evaluating.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        for (_, tracker) in state.trackers.drain() {
            tracker.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::BotProfile;
    use crate::types::{Mention, Quote};

    #[derive(Default)]
    struct RecordingReconnector {
        calls: Mutex<Vec<(BotId, Option<InboundMessage>)>>,
    }

    impl RecordingReconnector {
        fn calls(&self) -> Vec<(BotId, Option<InboundMessage>)> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl Reconnector for RecordingReconnector {
        async fn reconnect(&self, bot: &BotId, payload: Option<InboundMessage>) -> Result<()> {
            self.calls.lock().expect("calls").push((bot.clone(), payload));
            Ok(())
        }
    }

    fn roster() -> Arc<BotRoster> {
        let bots = [("Ada", "+1001"), ("Bea", "+1002"), ("Cy", "+1003")]
            .into_iter()
            .map(|(name, number)| BotProfile {
                name: name.to_string(),
                number: number.to_string(),
                uuid: Some(format!("{}-uuid", name.to_lowercase())),
                agent_id: format!("agent-{name}"),
            })
            .collect();
        Arc::new(BotRoster::new(bots).expect("roster"))
    }

    fn checker() -> (Arc<ConsistencyChecker>, Arc<RecordingReconnector>) {
        let reconnector = Arc::new(RecordingReconnector::default());
        let checker = Arc::new(ConsistencyChecker::new(
            roster(),
            reconnector.clone(),
            DEFAULT_CONSISTENCY_WINDOW,
        ));
        (checker, reconnector)
    }

    fn arrival(bot: &str, ts: i64) -> InboundMessage {
        InboundMessage {
            source_id: "+1999".to_string(),
            source_alias: None,
            source_name: None,
            conversation: "group-1".into(),
            is_group: true,
            receiving_bot: bot.into(),
            text: "\u{FFFC} can you check?".to_string(),
            mentions: vec![Mention {
                offset: 0,
                length: 1,
                target: "+1003".to_string(),
                label: None,
            }],
            quote: None,
            timestamp: ts,
            is_reprocessed: false,
        }
    }

    async fn let_window_pass() {
        tokio::time::sleep(DEFAULT_CONSISTENCY_WINDOW + Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn targeted_bot_that_missed_message_is_reconnected_once() {
        let (checker, reconnector) = checker();
        checker.record_arrival(&arrival("+1001", 1));
        checker.record_arrival(&arrival("+1002", 1));
        assert_eq!(checker.pending(), 1);

        let_window_pass().await;

        let calls = reconnector.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_str(), "+1003");
        assert_eq!(calls[0].1.as_ref().map(InboundMessage::key), Some(arrival("+1001", 1).key()));
        assert_eq!(checker.pending(), 0);
        assert_eq!(checker.stats().repairs_requested, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_before_deadline_needs_no_repair() {
        let (checker, reconnector) = checker();
        checker.record_arrival(&arrival("+1001", 2));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        checker.record_arrival(&arrival("+1003", 2));

        let_window_pass().await;
        assert!(reconnector.calls().is_empty());
        assert_eq!(checker.stats().evaluated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn untargeted_misses_are_reported_only() {
        let (checker, reconnector) = checker();
        checker.record_arrival(&arrival("+1003", 3));

        let report = checker
            .evaluate(&arrival("+1003", 3).key())
            .await
            .expect("report");
        assert_eq!(report.received, vec![BotId::from("+1003")]);
        assert_eq!(report.missing, vec![BotId::from("+1001"), BotId::from("+1002")]);
        assert!(report.targeted_missing.is_empty());
        assert!(!report.is_bot_message);

        // Eviction cancelled the armed timer.
        let_window_pass().await;
        assert!(reconnector.calls().is_empty());
        assert_eq!(checker.stats().evaluated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evaluated_messages_are_never_reopened() {
        let (checker, reconnector) = checker();
        checker.record_arrival(&arrival("+1001", 4));
        let_window_pass().await;
        assert_eq!(reconnector.calls().len(), 1);

        checker.record_arrival(&arrival("+1002", 4));
        assert_eq!(checker.pending(), 0);
        let_window_pass().await;
        assert_eq!(reconnector.calls().len(), 1);
        assert!(checker.evaluate(&arrival("+1001", 4).key()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn direct_evaluation_releases_the_armed_timer() {
        let (checker, _) = checker();
        checker.record_arrival(&arrival("+1001", 9));
        assert_eq!(Arc::strong_count(&checker), 2);

        checker
            .evaluate(&arrival("+1001", 9).key())
            .await
            .expect("report");
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::strong_count(&checker), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quoted_bot_is_resolved_by_uuid() {
        let (checker, reconnector) = checker();
        let mut message = arrival("+1001", 5);
        message.mentions.clear();
        message.quote = Some(Quote {
            author: "bea-uuid".to_string(),
        });
        checker.record_arrival(&message);
        let report = checker.evaluate(&message.key()).await.expect("report");
        assert_eq!(report.targeted_missing, vec![BotId::from("+1002")]);
        assert_eq!(reconnector.calls()[0].0.as_str(), "+1002");
    }

    #[tokio::test(start_paused = true)]
    async fn direct_messages_and_replays_are_not_tracked() {
        let (checker, _) = checker();
        let mut direct = arrival("+1001", 6);
        direct.is_group = false;
        checker.record_arrival(&direct);
        checker.record_arrival(&arrival("+1001", 7).reprocessed_for(&BotId::from("+1003")));
        assert_eq!(checker.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let (checker, reconnector) = checker();
        checker.record_arrival(&arrival("+1001", 8));
        checker.shutdown();
        let_window_pass().await;
        assert!(reconnector.calls().is_empty());
        assert_eq!(checker.stats().evaluated, 0);
    }
}
