use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var {0}")]
    MissingCredentials(&'static str),
    #[error("bad command '{0}': expected \"SYMBOL EXCHANGE QTY FUNDING%\" e.g. \"LPT Bybit 10 -0.1%\"")]
    BadCommand(String),
    #[error("bad percent '{0}': expected like -0.3% or -2%")]
    BadPercent(String),
    #[error("quantity must be > 0, got {0}")]
    BadQty(f64),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub bybit: BybitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BybitConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_public_ws_url")]
    pub public_ws_url: String,
    #[serde(default = "default_private_ws_url")]
    pub private_ws_url: String,
    #[serde(default = "default_trade_ws_url")]
    pub trade_ws_url: String,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_ping_interval_s")]
    pub ping_interval_s: u64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            public_ws_url: default_public_ws_url(),
            private_ws_url: default_private_ws_url(),
            trade_ws_url: default_trade_ws_url(),
            recv_window_ms: default_recv_window_ms(),
            ping_interval_s: default_ping_interval_s(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

impl BybitConfig {
    pub fn recv_window_ms(&self) -> u64 {
        self.recv_window_ms.max(1_000)
    }

    pub fn ping_interval_s(&self) -> u64 {
        self.ping_interval_s.max(1)
    }

    pub fn reconnect_backoff_ms(&self) -> u64 {
        self.reconnect_backoff_ms.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let cfg = toml::from_str(&raw)?;
        Ok(cfg)
    }
}

fn default_rest_url() -> String {
    "https://api.bybit.com".to_string()
}

fn default_public_ws_url() -> String {
    "wss://stream.bybit.com/v5/public/linear".to_string()
}

fn default_private_ws_url() -> String {
    "wss://stream.bybit.com/v5/private".to_string()
}

fn default_trade_ws_url() -> String {
    "wss://stream.bybit.com/v5/trade".to_string()
}

fn default_recv_window_ms() -> u64 {
    5_000
}

fn default_ping_interval_s() -> u64 {
    20
}

fn default_reconnect_backoff_ms() -> u64 {
    500
}

fn default_log_file() -> String {
    "fun.log".to_string()
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

const API_KEY_ENV: &str = "BYBIT_API_KEY";
const API_SECRET_ENV: &str = "BYBIT_API_SECRET";

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key =
            non_empty_env(API_KEY_ENV).ok_or(ConfigError::MissingCredentials(API_KEY_ENV))?;
        let api_secret =
            non_empty_env(API_SECRET_ENV).ok_or(ConfigError::MissingCredentials(API_SECRET_ENV))?;
        Ok(Self {
            api_key,
            api_secret,
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Tuning knobs, all read from `FUN_*` environment variables. Unset or
/// unparsable values fall back to the defaults below.
#[derive(Debug, Clone)]
pub struct FunSettings {
    pub fast_prep_lead_sec: f64,
    pub fast_close_delay_sec: f64,
    pub fast_close_max_attempts: u32,
    pub open_early_ms: i64,
    pub ws_fix_lead_ms: i64,
    pub late_tol_ms: i64,
    pub entry_base_bps: f64,
    pub entry_funding_mult: f64,
    pub entry_min_bps: f64,
    pub entry_max_bps: f64,
    pub open_limit_ticks: u32,
    pub open_safety_ticks: u32,
    pub open_safety_min_ticks: u32,
    pub open_max_staleness_ms: i64,
    pub balance_buffer_usdt: f64,
    pub balance_fee_safety_bps: f64,
    pub use_trade_ws: bool,
}

impl Default for FunSettings {
    fn default() -> Self {
        Self {
            fast_prep_lead_sec: 2.0,
            fast_close_delay_sec: 1.2,
            fast_close_max_attempts: 15,
            open_early_ms: 30,
            ws_fix_lead_ms: 30,
            late_tol_ms: 400,
            entry_base_bps: 40.0,
            entry_funding_mult: 0.9,
            entry_min_bps: 30.0,
            entry_max_bps: 2_500.0,
            open_limit_ticks: 1,
            open_safety_ticks: 1,
            open_safety_min_ticks: 3,
            open_max_staleness_ms: 200,
            balance_buffer_usdt: 0.0,
            balance_fee_safety_bps: 20.0,
            use_trade_ws: true,
        }
    }
}

impl FunSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fast_prep_lead_sec: env_f64("FUN_FAST_PREP_LEAD_SEC", d.fast_prep_lead_sec),
            fast_close_delay_sec: env_f64("FUN_FAST_CLOSE_DELAY_SEC", d.fast_close_delay_sec),
            fast_close_max_attempts: env_u32(
                "FUN_FAST_CLOSE_MAX_ATTEMPTS",
                d.fast_close_max_attempts,
            ),
            open_early_ms: env_i64("FUN_OPEN_EARLY_MS", d.open_early_ms),
            ws_fix_lead_ms: env_i64("FUN_WS_FIX_LEAD_MS", d.ws_fix_lead_ms),
            late_tol_ms: env_i64("FUN_LATE_TOL_MS", d.late_tol_ms),
            entry_base_bps: env_f64("FUN_ENTRY_BASE_BPS", d.entry_base_bps),
            entry_funding_mult: env_f64("FUN_ENTRY_FUNDING_MULT", d.entry_funding_mult),
            entry_min_bps: env_f64("FUN_ENTRY_MIN_BPS", d.entry_min_bps),
            entry_max_bps: env_f64("FUN_ENTRY_MAX_BPS", d.entry_max_bps),
            open_limit_ticks: env_u32("FUN_OPEN_LIMIT_TICKS", d.open_limit_ticks),
            open_safety_ticks: env_u32("FUN_OPEN_SAFETY_TICKS", d.open_safety_ticks),
            open_safety_min_ticks: env_u32("FUN_OPEN_SAFETY_MIN_TICKS", d.open_safety_min_ticks),
            open_max_staleness_ms: env_i64("FUN_OPEN_MAX_STALENESS_MS", d.open_max_staleness_ms),
            balance_buffer_usdt: env_f64("FUN_BALANCE_BUFFER_USDT", d.balance_buffer_usdt),
            balance_fee_safety_bps: env_f64(
                "FUN_BALANCE_FEE_SAFETY_BPS",
                d.balance_fee_safety_bps,
            ),
            use_trade_ws: env_u32("FUN_USE_TRADE_WS", 1) != 0,
        }
    }

    pub fn fast_close_max_attempts(&self) -> u32 {
        self.fast_close_max_attempts.max(1)
    }

    pub fn open_early_ms(&self) -> i64 {
        self.open_early_ms.max(0)
    }

    pub fn ws_fix_lead_ms(&self) -> i64 {
        self.ws_fix_lead_ms.max(0)
    }

    pub fn late_tol_ms(&self) -> i64 {
        self.late_tol_ms.max(0)
    }

    pub fn open_max_staleness_ms(&self) -> i64 {
        self.open_max_staleness_ms.max(1)
    }

    /// Tick offset applied under the bid on open and above the ask on close.
    pub fn entry_ticks(&self) -> u32 {
        self.open_limit_ticks
            .max(self.open_safety_ticks)
            .max(self.open_safety_min_ticks)
            .max(1)
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

/// Parsed `fun "<SYMBOL> <EXCHANGE> <QTY> <FUNDING_PCT>"` command.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeCommand {
    pub coin: String,
    pub symbol: String,
    pub exchange: String,
    pub qty: f64,
    /// Decimal fraction, e.g. -0.1% -> -0.001.
    pub funding_pct: f64,
}

impl TradeCommand {
    pub fn parse(cmd: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        if parts.len() != 4 {
            return Err(ConfigError::BadCommand(cmd.to_string()));
        }

        let coin = parts[0].to_uppercase();
        let exchange = parts[1].to_lowercase();
        let qty = parts[2]
            .parse::<f64>()
            .map_err(|_| ConfigError::BadCommand(cmd.to_string()))?;
        if !qty.is_finite() || qty <= 0.0 {
            return Err(ConfigError::BadQty(qty));
        }
        let funding_pct = parse_percent(parts[3])?;

        let symbol = if coin.ends_with("USDT") {
            coin.clone()
        } else {
            format!("{coin}USDT")
        };

        Ok(Self {
            coin,
            symbol,
            exchange,
            qty,
            funding_pct,
        })
    }
}

/// "-0.3%" -> -0.003
fn parse_percent(raw: &str) -> Result<f64, ConfigError> {
    let trimmed = raw.trim();
    let Some(number) = trimmed.strip_suffix('%') else {
        return Err(ConfigError::BadPercent(raw.to_string()));
    };
    let value = number
        .trim()
        .parse::<f64>()
        .map_err(|_| ConfigError::BadPercent(raw.to_string()))?;
    if !value.is_finite() {
        return Err(ConfigError::BadPercent(raw.to_string()));
    }
    Ok(value / 100.0)
}
