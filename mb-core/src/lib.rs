//! Routing and consistency engine for a roster of bots sharing Signal
//! conversations.
//!
//! Pure decision logic plus in-memory coordination state: deduplication,
//! fan-in repair, response routing, mention encoding, chunking and connection
//! backoff. Transport I/O lives in `mb-channels`; wiring lives in `mb-app`.

mod chunker;
mod consistency;
mod dedup;
mod error;
mod interaction;
mod mentions;
mod reconnect;
mod roster;
mod router;
mod store;
mod types;

pub use chunker::{Chunks, split_message};
pub use consistency::{
    ConsistencyChecker, ConsistencyReport, ConsistencyStats, DEFAULT_CONSISTENCY_WINDOW,
    Reconnector,
};
pub use dedup::{DEFAULT_DEDUP_TTL, DEFAULT_SWEEP_INTERVAL, DeduplicationRecord, Deduplicator};
pub use error::{CoreError, Result};
pub use interaction::{DEFAULT_BOT_TO_BOT_LIMIT, InteractionCounters, InteractionGrant};
pub use mentions::{
    EncodedText, IdentityDirectory, MENTION_PLACEHOLDER, MentionTarget, ProfileCache,
    decode_mentions, encode_mentions, utf16_len,
};
pub use reconnect::{
    ConnectionState, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_WINDOW, FeedConnector,
    LinkSnapshot, ReadySignal, ReconnectManager, ReconnectPolicy, ReconnectState, ReconnectStep,
};
pub use roster::{BotProfile, BotRoster};
pub use router::{
    ESCAPE_MARKER, PrivacyMode, RandomSource, ResponseRouter, RoutedMessage, RoutingOutcome,
    RoutingSettings, ThreadRandom, strip_escape_marker,
};
pub use store::{MemoryStateStore, MessageRecord, ProfileRecord, StateStore, StreamRecord};
pub use types::{
    ActivationRequest, BotId, ConversationKey, InboundMessage, Mention, MessageKey, Quote,
    ResponseReason, RoutingDecision,
};
