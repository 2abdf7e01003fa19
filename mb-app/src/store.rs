//! SQLite-backed [`StateStore`].

use anyhow::Context;
use async_trait::async_trait;
use mb_core::{
    ActivationRequest, BotId, ConversationKey, CoreError, MessageKey, MessageRecord,
    ProfileRecord, StateStore, StreamRecord,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key_source TEXT NOT NULL,
    key_timestamp INTEGER NOT NULL,
    conversation TEXT NOT NULL,
    source_id TEXT NOT NULL,
    is_group INTEGER NOT NULL,
    from_bot INTEGER NOT NULL,
    text TEXT NOT NULL,
    context_bots TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    UNIQUE (key_source, key_timestamp)
);
CREATE INDEX IF NOT EXISTS messages_conversation ON messages (conversation, seq);

CREATE TABLE IF NOT EXISTS profiles (
    identity TEXT PRIMARY KEY,
    alias TEXT,
    display_name TEXT,
    is_bot INTEGER NOT NULL,
    first_seen TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS streams (
    conversation TEXT PRIMARY KEY,
    is_group INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activations (
    id TEXT PRIMARY KEY,
    bot TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    conversation TEXT NOT NULL,
    is_group INTEGER NOT NULL,
    message_source TEXT NOT NULL,
    message_timestamp INTEGER NOT NULL,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (bot, message_source, message_timestamp)
);

CREATE TABLE IF NOT EXISTS interaction_counts (
    bot TEXT NOT NULL,
    conversation TEXT NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (bot, conversation)
);
"#;

#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite store {}", path.display()))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("enable WAL journal")?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "sqlite store opened");
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA).context("apply store schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> mb_core::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&conn)
        })
        .await
        .map_err(|e| CoreError::Store(format!("store task failed: {e}")))?
        .map_err(|e| CoreError::Store(e.to_string()))
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn message_exists(&self, key: &MessageKey) -> mb_core::Result<bool> {
        let (source, ts) = (key.source_id.clone(), key.timestamp);
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM messages WHERE key_source = ?1 AND key_timestamp = ?2",
                params![source, ts],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
        .await
    }

    async fn record_message(&self, record: &MessageRecord) -> mb_core::Result<()> {
        let context_bots = serde_json::to_string(&record.context_bots)?;
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO messages
                    (key_source, key_timestamp, conversation, source_id, is_group, from_bot,
                     text, context_bots, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.key.source_id,
                    record.key.timestamp,
                    record.conversation.as_str(),
                    record.source_id,
                    record.is_group,
                    record.from_bot,
                    record.text,
                    context_bots,
                    record.recorded_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn profile_exists(&self, identity: &str) -> mb_core::Result<bool> {
        let identity = identity.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM profiles WHERE identity = ?1",
                params![identity],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
        .await
    }

    async fn record_profile(&self, record: &ProfileRecord) -> mb_core::Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO profiles (identity, alias, display_name, is_bot, first_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.identity,
                    record.alias,
                    record.display_name,
                    record.is_bot,
                    record.first_seen.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn stream_exists(&self, conversation: &ConversationKey) -> mb_core::Result<bool> {
        let conversation = conversation.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM streams WHERE conversation = ?1",
                params![conversation],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
        .await
    }

    async fn record_stream(&self, record: &StreamRecord) -> mb_core::Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO streams (conversation, is_group, created_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    record.conversation.as_str(),
                    record.is_group,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn record_activation(&self, request: &ActivationRequest) -> mb_core::Result<bool> {
        let request = request.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO activations
                    (id, bot, agent_id, conversation, is_group, message_source,
                     message_timestamp, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    request.id.to_string(),
                    request.bot.as_str(),
                    request.agent_id,
                    request.conversation.as_str(),
                    request.is_group,
                    request.message.source_id,
                    request.message.timestamp,
                    request.reason.as_str(),
                    request.created_at.to_rfc3339(),
                ],
            )
            .map(|inserted| inserted == 1)
        })
        .await
    }

    async fn bot_messages_since_human(
        &self,
        conversation: &ConversationKey,
    ) -> mb_core::Result<usize> {
        let conversation = conversation.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation = ?1 AND from_bot = 1
                   AND seq > COALESCE(
                       (SELECT MAX(seq) FROM messages WHERE conversation = ?1 AND from_bot = 0),
                       0)",
                params![conversation],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn interaction_count(
        &self,
        bot: &BotId,
        conversation: &ConversationKey,
    ) -> mb_core::Result<u32> {
        let (bot, conversation) = (bot.to_string(), conversation.to_string());
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT count FROM interaction_counts WHERE bot = ?1 AND conversation = ?2",
                params![bot, conversation],
                |row| row.get::<_, u32>(0),
            )
            .optional()
            .map(|count| count.unwrap_or(0))
        })
        .await
    }

    async fn set_interaction_count(
        &self,
        bot: &BotId,
        conversation: &ConversationKey,
        count: u32,
    ) -> mb_core::Result<()> {
        let (bot, conversation) = (bot.to_string(), conversation.to_string());
        self.with_conn(move |conn| {
            if count == 0 {
                conn.execute(
                    "DELETE FROM interaction_counts WHERE bot = ?1 AND conversation = ?2",
                    params![bot, conversation],
                )?;
            } else {
                conn.execute(
                    "INSERT INTO interaction_counts (bot, conversation, count) VALUES (?1, ?2, ?3)
                     ON CONFLICT (bot, conversation) DO UPDATE SET count = excluded.count",
                    params![bot, conversation, count],
                )?;
            }
            Ok(())
        })
        .await
    }

    async fn clear_interaction_counts(
        &self,
        conversation: &ConversationKey,
    ) -> mb_core::Result<()> {
        let conversation = conversation.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM interaction_counts WHERE conversation = ?1",
                params![conversation],
            )
            .map(|_| ())
        })
        .await
    }
}
