use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How updates reach the bot. Exactly one is active per deployment.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BotMode {
    #[default]
    Polling,
    Webhook,
}

impl std::fmt::Display for BotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotMode::Polling => write!(f, "polling"),
            BotMode::Webhook => write!(f, "webhook"),
        }
    }
}

impl FromStr for BotMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" | "poll" => Ok(BotMode::Polling),
            "webhook" => Ok(BotMode::Webhook),
            other => bail!("unknown bot mode '{}' (expected 'polling' or 'webhook')", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub mode: BotMode,
    /// Long-poll timeout passed to getUpdates
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL registered with Telegram on startup (webhook mode only)
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Expected value of the `X-Telegram-Bot-Api-Secret-Token` header
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    /// Number of recent update ids remembered for deduplication
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    /// A session lane with no traffic for this long is retired
    #[serde(default = "default_lane_idle_secs")]
    pub lane_idle_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Total send attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

fn default_poll_timeout_secs() -> u32 {
    30
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8443
}

fn default_dedup_window() -> usize {
    1024
}

fn default_lane_idle_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_send_timeout_secs() -> u64 {
    10
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_secs() -> u64 {
    30
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("meals.db")
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            mode: BotMode::default(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            webhook_url: None,
            webhook_secret: None,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_window: default_dedup_window(),
            lane_idle_secs: default_lane_idle_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            send_timeout_secs: default_send_timeout_secs(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl DispatcherConfig {
    pub fn lane_idle(&self) -> Duration {
        Duration::from_secs(self.lane_idle_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl DeliveryConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, value, e))
}

impl Config {
    /// Load configuration: optional TOML file first, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                Self::from_toml(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from environment variables looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v.trim().to_string();
        }
        if let Some(v) = var("BOT_MODE") {
            self.telegram.mode = parse_var("BOT_MODE", &v)?;
        }
        if let Some(v) = var("POLL_TIMEOUT_SECS") {
            self.telegram.poll_timeout_secs = parse_var("POLL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("BIND_ADDRESS") {
            self.server.bind_address = parse_var("BIND_ADDRESS", &v)?;
        }
        if let Some(v) = var("PORT") {
            self.server.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = var("WEBHOOK_URL") {
            self.server.webhook_url = Some(v.trim().to_string());
        }
        if let Some(v) = var("WEBHOOK_SECRET") {
            self.server.webhook_secret = Some(v);
        }
        if let Some(v) = var("DEDUP_WINDOW") {
            self.dispatcher.dedup_window = parse_var("DEDUP_WINDOW", &v)?;
        }
        if let Some(v) = var("LANE_IDLE_SECS") {
            self.dispatcher.lane_idle_secs = parse_var("LANE_IDLE_SECS", &v)?;
        }
        if let Some(v) = var("SHUTDOWN_GRACE_SECS") {
            self.dispatcher.shutdown_grace_secs = parse_var("SHUTDOWN_GRACE_SECS", &v)?;
        }
        if let Some(v) = var("SEND_MAX_ATTEMPTS") {
            self.delivery.max_attempts = parse_var("SEND_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("SEND_TIMEOUT_SECS") {
            self.delivery.send_timeout_secs = parse_var("SEND_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("RETRY_BASE_DELAY_MS") {
            self.delivery.base_delay_ms = parse_var("RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = var("RETRY_MAX_DELAY_SECS") {
            self.delivery.max_delay_secs = parse_var("RETRY_MAX_DELAY_SECS", &v)?;
        }
        if let Some(v) = var("LEDGER_PATH") {
            self.ledger.path = PathBuf::from(v.trim());
        }

        Ok(())
    }

    /// Reject configurations the bot cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.is_empty() {
            bail!("TELEGRAM_BOT_TOKEN is not set");
        }
        if self.dispatcher.dedup_window == 0 {
            bail!("DEDUP_WINDOW must be at least 1");
        }
        if self.delivery.max_attempts == 0 {
            bail!("SEND_MAX_ATTEMPTS must be at least 1");
        }
        if self.delivery.send_timeout_secs == 0 {
            bail!("SEND_TIMEOUT_SECS must be at least 1");
        }
        if self.telegram.mode == BotMode::Webhook && self.server.port == 0 {
            bail!("PORT must be set in webhook mode");
        }
        if let Some(url) = &self.server.webhook_url {
            let parsed = reqwest::Url::parse(url)
                .with_context(|| format!("WEBHOOK_URL is not a valid URL: {}", url))?;
            if parsed.scheme() != "https" {
                bail!("WEBHOOK_URL must use https: {}", url);
            }
        }
        Ok(())
    }
}
