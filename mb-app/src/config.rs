//! multibot configuration loader.

use mb_channels::{DEFAULT_MAX_MESSAGE_LENGTH, DEFAULT_REQUEST_TIMEOUT};
use mb_core::{
    BotProfile, BotRoster, DEFAULT_BOT_TO_BOT_LIMIT, PrivacyMode, ReconnectPolicy,
    RoutingSettings,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct MultibotConfig {
    pub signal: SignalConfig,
    #[serde(default)]
    pub bots: Vec<BotProfile>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    pub api_base_url: String,
    /// Websocket base when receive traffic goes through a different host.
    #[serde(default)]
    pub ws_base_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub privacy_mode: PrivacyMode,
    /// "1-in-N" chance of an unprompted group reply; 0 disables.
    #[serde(default)]
    pub random_reply_rate: u32,
    #[serde(default = "default_bot_to_bot_limit")]
    pub bot_to_bot_limit: u32,
    #[serde(default)]
    pub max_bot_responses: Option<usize>,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

fn default_bot_to_bot_limit() -> u32 {
    DEFAULT_BOT_TO_BOT_LIMIT
}

fn default_max_message_length() -> usize {
    DEFAULT_MAX_MESSAGE_LENGTH
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            privacy_mode: PrivacyMode::default(),
            random_reply_rate: 0,
            bot_to_bot_limit: default_bot_to_bot_limit(),
            max_bot_responses: None,
            max_message_length: default_max_message_length(),
        }
    }
}

impl RoutingConfig {
    pub fn settings(&self) -> RoutingSettings {
        RoutingSettings {
            privacy_mode: self.privacy_mode,
            random_reply_rate: self.random_reply_rate,
            bot_to_bot_limit: self.bot_to_bot_limit,
            max_bot_responses: self.max_bot_responses,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsistencyConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_dedup_ttl_ms")]
    pub dedup_ttl_ms: u64,
    #[serde(default = "default_dedup_sweep_ms")]
    pub dedup_sweep_ms: u64,
}

fn default_window_ms() -> u64 {
    2000
}

fn default_dedup_ttl_ms() -> u64 {
    10_000
}

fn default_dedup_sweep_ms() -> u64 {
    5000
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            dedup_ttl_ms: default_dedup_ttl_ms(),
            dedup_sweep_ms: default_dedup_sweep_ms(),
        }
    }
}

impl ConsistencyConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn dedup_sweep(&self) -> Duration {
        Duration::from_millis(self.dedup_sweep_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_window_secs")]
    pub max_window_secs: u64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_window_secs() -> u64 {
    300
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_window_secs: default_max_window_secs(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_window: Duration::from_secs(self.max_window_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponderConfig {
    /// Agent endpoint receiving activation requests. Unset: activations are
    /// only recorded.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_responder_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_responder_timeout_secs() -> u64 {
    120
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_token: None,
            timeout_secs: default_responder_timeout_secs(),
        }
    }
}

impl ResponderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite file; `:memory:` keeps state in-process only.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "~/.multibot/data/multibot.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path.trim() == ":memory:"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_server_enabled() -> bool {
    true
}

fn default_server_port() -> u16 {
    8787
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            port: default_server_port(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

impl MultibotConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: MultibotConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = lookup("MULTIBOT_SIGNAL_API_URL") {
            self.signal.api_base_url = v;
        }
        if let Some(v) = lookup("MULTIBOT_SIGNAL_API_TOKEN") {
            self.signal.api_token = Some(v);
        }
        if let Some(v) = lookup("MULTIBOT_RESPONDER_URL") {
            self.responder.url = Some(v);
        }
        if let Some(v) = lookup("MULTIBOT_RESPONDER_TOKEN") {
            self.responder.auth_token = Some(v);
        }
        if let Some(v) = lookup("MULTIBOT_STORE_PATH") {
            self.store.path = v;
        }
        if let Some(v) = lookup("MULTIBOT_PRIVACY_MODE") {
            match v.trim().to_ascii_lowercase().as_str() {
                "opt-in" => self.routing.privacy_mode = PrivacyMode::OptIn,
                "opt-out" => self.routing.privacy_mode = PrivacyMode::OptOut,
                other => tracing::warn!(
                    value = other,
                    "ignoring MULTIBOT_PRIVACY_MODE; expected opt-in or opt-out"
                ),
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.signal.api_base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("signal.api_base_url is required"));
        }
        if self.signal.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("signal.request_timeout_secs must be > 0"));
        }
        if self.bots.is_empty() {
            return Err(anyhow::anyhow!("at least one [[bots]] entry is required"));
        }
        self.roster()?;
        if let Some(bot) = self.bots.iter().find(|bot| bot.agent_id.trim().is_empty()) {
            return Err(anyhow::anyhow!("bots[{}].agent_id is required", bot.name));
        }
        if self.routing.max_message_length == 0 {
            return Err(anyhow::anyhow!("routing.max_message_length must be > 0"));
        }
        if self.consistency.window_ms == 0
            || self.consistency.dedup_ttl_ms == 0
            || self.consistency.dedup_sweep_ms == 0
        {
            return Err(anyhow::anyhow!(
                "consistency.window_ms, dedup_ttl_ms and dedup_sweep_ms must be > 0"
            ));
        }
        if self.reconnect.base_delay_ms == 0 || self.reconnect.max_window_secs == 0 {
            return Err(anyhow::anyhow!(
                "reconnect.base_delay_ms and reconnect.max_window_secs must be > 0"
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(anyhow::anyhow!(
                "reconnect.max_delay_ms must be >= reconnect.base_delay_ms"
            ));
        }
        if self.responder.timeout_secs == 0 {
            return Err(anyhow::anyhow!("responder.timeout_secs must be > 0"));
        }
        if self.server.enabled && self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        Ok(())
    }

    pub fn roster(&self) -> anyhow::Result<BotRoster> {
        BotRoster::new(self.bots.clone()).map_err(|e| anyhow::anyhow!("invalid bot roster: {e}"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.signal.request_timeout_secs)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".multibot").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}
