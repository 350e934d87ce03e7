use alloy::primitives::Address;
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::alert::gate::Cooldowns;
use crate::notify::DispatchPolicy;
use crate::onchain::abi;
use crate::onchain::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Minutes between transaction polls per chain.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_minutes: u64,
    #[serde(default = "default_balance_interval")]
    pub balance_check_interval_minutes: u64,
    /// "HH:MM" in UTC. The report covers the previous UTC day.
    #[serde(default = "default_report_time")]
    pub report_time_utc: String,
    /// Suppression window for repeated low-balance alerts.
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_minutes: u64,
    /// A call still Pending after this long raises a stuck warning. Also the
    /// window in which an undelivered failed-withdrawal alert keeps being retried.
    #[serde(default = "default_stale_pending")]
    pub stale_pending_hours: u64,
    /// Blocks below the watermark that are rescanned every cycle.
    #[serde(default = "default_reorg_overlap")]
    pub reorg_overlap_blocks: u64,
    /// How far behind head the very first scan starts.
    #[serde(default = "default_initial_range")]
    pub initial_block_range: u64,
    /// Largest block range fetched in one cycle.
    #[serde(default = "default_max_range")]
    pub max_block_range: u64,
    #[serde(default = "default_retention")]
    pub retention_hours: u64,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    /// How long a chain's ledger lock outlives a crashed holder.
    #[serde(default = "default_lock_ttl")]
    pub ledger_lock_ttl_secs: u64,
    /// A balance below `threshold * critical_ratio` is flagged critical.
    #[serde(default = "default_critical_ratio")]
    pub critical_ratio: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_dispatch_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_dispatch_timeout")]
    pub send_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Loaded from env TELEGRAM_BOT_TOKEN
    #[serde(default)]
    pub bot_token: String,
    /// Loaded from env TELEGRAM_CHAT_ID
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_telegram_api")]
    pub api_url: String,
    #[serde(default = "default_telegram_timeout")]
    pub request_timeout_secs: u64,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackendKind {
    File,
    Valkey,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_backend")]
    pub backend: LedgerBackendKind,
    /// Directory for the file backend.
    #[serde(default = "default_ledger_path")]
    pub path: String,
    /// Overridden by env VALKEY_URL
    #[serde(default = "default_valkey_url")]
    pub valkey_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    /// Prefix of the env var holding the RPC URL (`{ALIAS}_RPC_URL`).
    /// Defaults to the upper-cased chain name.
    #[serde(default)]
    pub rpc_alias: Option<String>,
    #[serde(default)]
    pub rpc_url: String,
    pub explorer_url: String,
    pub contract_address: Address,
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,
    /// Native balance is only checked when a threshold is set.
    #[serde(default)]
    pub native_low_balance_threshold: Option<Decimal>,
    /// Decimals of the `amount` argument of withdraw calls.
    #[serde(default = "default_amount_decimals")]
    pub amount_decimals: u8,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub contract_address: Address,
    pub low_balance_threshold: Decimal,
}

impl ChainConfig {
    pub fn rpc_env_var(&self) -> String {
        let alias = self.rpc_alias.clone().unwrap_or_else(|| self.name.clone());
        let alias: String = alias
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{alias}_RPC_URL")
    }
}

fn default_poll_interval() -> u64 {
    5
}
fn default_balance_interval() -> u64 {
    60
}
fn default_report_time() -> String {
    "09:00".to_string()
}
fn default_alert_cooldown() -> u64 {
    60
}
fn default_stale_pending() -> u64 {
    3
}
fn default_reorg_overlap() -> u64 {
    12
}
fn default_initial_range() -> u64 {
    1000
}
fn default_max_range() -> u64 {
    500
}
fn default_retention() -> u64 {
    48
}
fn default_rpc_timeout() -> u64 {
    20
}
fn default_lock_ttl() -> u64 {
    600
}
fn default_critical_ratio() -> Decimal {
    Decimal::new(5, 1)
}
fn default_retry_attempts() -> u32 {
    4
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_retry_max_ms() -> u64 {
    8000
}
fn default_dispatch_attempts() -> u32 {
    3
}
fn default_dispatch_base_ms() -> u64 {
    1000
}
fn default_dispatch_timeout() -> u64 {
    30
}
fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}
fn default_telegram_timeout() -> u64 {
    15
}
fn default_ledger_backend() -> LedgerBackendKind {
    LedgerBackendKind::File
}
fn default_ledger_path() -> String {
    "data/ledger".to_string()
}
fn default_valkey_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_key_prefix() -> String {
    "withdraw-watch".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_native_symbol() -> String {
    "ETH".to_string()
}
fn default_amount_decimals() -> u8 {
    18
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            poll_interval_minutes: default_poll_interval(),
            balance_check_interval_minutes: default_balance_interval(),
            report_time_utc: default_report_time(),
            alert_cooldown_minutes: default_alert_cooldown(),
            stale_pending_hours: default_stale_pending(),
            reorg_overlap_blocks: default_reorg_overlap(),
            initial_block_range: default_initial_range(),
            max_block_range: default_max_range(),
            retention_hours: default_retention(),
            rpc_timeout_secs: default_rpc_timeout(),
            ledger_lock_ttl_secs: default_lock_ttl(),
            critical_ratio: default_critical_ratio(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_dispatch_attempts(),
            base_delay_ms: default_dispatch_base_ms(),
            send_timeout_secs: default_dispatch_timeout(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            api_url: default_telegram_api(),
            request_timeout_secs: default_telegram_timeout(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: default_ledger_backend(),
            path: default_ledger_path(),
            valkey_url: default_valkey_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl MonitoringConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_minutes * 60)
    }

    pub fn balance_check_interval(&self) -> Duration {
        Duration::from_secs(self.balance_check_interval_minutes * 60)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn ledger_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.ledger_lock_ttl_secs)
    }

    pub fn stale_pending(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_pending_hours as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    pub fn report_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.report_time_utc, "%H:%M").map_err(|e| {
            ConfigError::Invalid(format!(
                "report_time_utc {:?} is not HH:MM: {e}",
                self.report_time_utc
            ))
        })
    }

    pub fn cooldowns(&self) -> Cooldowns {
        Cooldowns {
            low_balance: chrono::Duration::minutes(self.alert_cooldown_minutes as i64),
            stuck: self.stale_pending(),
            classification_error: self.stale_pending(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl DispatchConfig {
    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
        }
    }
}

impl Config {
    /// Load config from a TOML file, overlay secrets from the environment and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Override secrets from environment variables (never store in config file).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(chat) = lookup("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = chat;
        }
        if let Some(url) = lookup("VALKEY_URL") {
            self.ledger.valkey_url = url;
        }
        for chain in &mut self.chains {
            if let Some(url) = lookup(&chain.rpc_env_var()) {
                chain.rpc_url = url;
            }
        }
    }

    /// Reject configurations the monitor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let m = &self.monitoring;

        if self.chains.is_empty() {
            return invalid("no chains configured".to_string());
        }
        if m.poll_interval_minutes == 0 || m.balance_check_interval_minutes == 0 {
            return invalid("check intervals must be at least one minute".to_string());
        }
        if m.max_block_range == 0 {
            return invalid("max_block_range must be positive".to_string());
        }
        if m.retention_hours < 25 {
            return invalid(format!(
                "retention_hours is {}, must be at least 25 to cover a full report day",
                m.retention_hours
            ));
        }
        if m.critical_ratio < Decimal::ZERO || m.critical_ratio > Decimal::ONE {
            return invalid(format!("critical_ratio {} must be within 0..=1", m.critical_ratio));
        }
        m.report_time()?;

        let mut ids = HashSet::new();
        for chain in &self.chains {
            if !ids.insert(chain.chain_id) {
                return invalid(format!("duplicate chain_id {}", chain.chain_id));
            }
            if chain.rpc_url.trim().is_empty() {
                return invalid(format!(
                    "chain {} has no rpc_url (set it in the file or {})",
                    chain.name,
                    chain.rpc_env_var()
                ));
            }
            if chain.explorer_url.trim().is_empty() {
                return invalid(format!("chain {} has no explorer_url", chain.name));
            }
            if chain.amount_decimals > 77 {
                return invalid(format!("chain {} amount_decimals is out of range", chain.name));
            }
            if chain.native_low_balance_threshold.is_some_and(|t| t < Decimal::ZERO) {
                return invalid(format!("chain {} native threshold is negative", chain.name));
            }
            let mut symbols = HashSet::new();
            for token in &chain.tokens {
                if token.low_balance_threshold < Decimal::ZERO {
                    return invalid(format!(
                        "token {} on {} has a negative threshold",
                        token.symbol, chain.name
                    ));
                }
                if !symbols.insert(token.symbol.as_str()) {
                    return invalid(format!("duplicate token {} on {}", token.symbol, chain.name));
                }
            }
        }

        for (sig, ok) in abi::verify_selectors() {
            if !ok {
                return invalid(format!("selector mismatch for {sig}"));
            }
        }
        Ok(())
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}
