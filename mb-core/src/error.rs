use crate::types::BotId;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown bot: {0}")]
    UnknownBot(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("reconnect window exhausted for bot {bot_id} after {elapsed:?}")]
    ReconnectExhausted { bot_id: BotId, elapsed: Duration },
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.to_string())
    }
}
