//! First-receiver bookkeeping for broadcast messages.
//!
//! Every bot connection sees the same group message. The first bot to report
//! a message id claims canonical processing; later arrivals within the TTL are
//! told to skip side effects.

use crate::types::{BotId, MessageKey};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeduplicationRecord {
    pub first_receiver: BotId,
    pub observed_at: Instant,
}

#[derive(Debug)]
pub struct Deduplicator {
    records: DashMap<MessageKey, DeduplicationRecord>,
    ttl: Duration,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL, DEFAULT_SWEEP_INTERVAL)
    }
}

impl Deduplicator {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn should_process(
        &self,
        key: &MessageKey,
        bot: &BotId,
        is_group: bool,
        is_reprocessed: bool,
    ) -> bool {
        self.should_process_at(key, bot, is_group, is_reprocessed, Instant::now())
    }

    pub fn should_process_at(
        &self,
        key: &MessageKey,
        bot: &BotId,
        is_group: bool,
        is_reprocessed: bool,
        now: Instant,
    ) -> bool {
        // Only one bot ever receives a DM; replays target one bot on purpose.
        if !is_group || is_reprocessed {
            return true;
        }

        self.sweep_if_due(now);

        let record = DeduplicationRecord {
            first_receiver: bot.clone(),
            observed_at: now,
        };
        match self.records.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(entry.get().observed_at) < self.ttl {
                    tracing::debug!(
                        message_key = %key,
                        bot_id = %bot,
                        first_receiver = %entry.get().first_receiver,
                        "duplicate arrival; canonical processing already claimed"
                    );
                    return false;
                }
                entry.insert(record);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
                true
            }
        }
    }

    pub fn first_receiver(&self, key: &MessageKey) -> Option<BotId> {
        self.records
            .get(key)
            .map(|record| record.first_receiver.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn sweep_if_due(&self, now: Instant) {
        let mut last_sweep = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
        if now.duration_since(*last_sweep) < self.sweep_interval {
            return;
        }
        *last_sweep = now;
        drop(last_sweep);

        let before = self.records.len();
        self.records
            .retain(|_, record| now.duration_since(record.observed_at) < self.ttl);
        let evicted = before.saturating_sub(self.records.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.records.len(), "dedup sweep");
        }
    }
}
