//! Signal transport glue for multibot.
//!
//! Adapters are pure I/O: they decode gateway envelopes into core
//! `InboundMessage`s and turn replies into REST sends.

mod feed;
mod outbound;
mod signal;
mod traits;

pub use feed::SignalFeed;
pub use outbound::{DEFAULT_MAX_MESSAGE_LENGTH, OutboundSender};
pub use signal::{DEFAULT_REQUEST_TIMEOUT, SignalClient, SignalGroup};
pub use traits::{OutboundMention, Recipient, SignalSend, SignalTransport};
