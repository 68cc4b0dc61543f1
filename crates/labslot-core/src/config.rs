//! Configuration management for labslot
//!
//! Handles loading and validation of labslot.toml configuration files.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default config file name, looked up in the working directory and then in
/// the platform config directory.
pub const CONFIG_FILE_NAME: &str = "labslot.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Reservation scheduling settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Expiry reaper settings
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Lab runtime service settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Payment processor settings
    #[serde(default)]
    pub payments: PaymentsConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How long a writer waits for the database lock
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("labslot")
        .join("labslot.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Free reservations starting within this many minutes are auto-started
    #[serde(default = "default_lookahead_minutes")]
    pub lookahead_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead_minutes: default_lookahead_minutes(),
        }
    }
}

fn default_lookahead_minutes() -> i64 {
    15
}

/// Expiry reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Minutes a paid reservation may stay pending without payment
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: i64,

    /// Seconds between maintenance passes in `watch` (0 disables the loop)
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// Maximum cancellations per sweep (0 = unbounded)
    #[serde(default)]
    pub batch_limit: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            grace_minutes: default_grace_minutes(),
            interval_seconds: default_interval_seconds(),
            batch_limit: 0,
        }
    }
}

fn default_grace_minutes() -> i64 {
    15
}

fn default_interval_seconds() -> u64 {
    300
}

/// Which lab runtime client to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// In-process simulation; labs flip between STOPPED and RUNNING
    #[default]
    Simulated,
    /// HTTP lab-control service at `base_url`
    Http,
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simulated => f.write_str("simulated"),
            Self::Http => f.write_str("http"),
        }
    }
}

/// Lab runtime service configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub mode: RuntimeMode,

    /// Base URL of the lab-control service (http mode)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token for the lab-control service
    #[serde(default)]
    pub token: Option<String>,

    /// Per-call timeout
    #[serde(default = "default_runtime_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("mode", &self.mode)
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::default(),
            base_url: None,
            token: None,
            timeout_seconds: default_runtime_timeout_seconds(),
        }
    }
}

fn default_runtime_timeout_seconds() -> u64 {
    20
}

/// Payment processor configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct PaymentsConfig {
    /// Shared secret for webhook signatures and checkout URLs
    #[serde(default)]
    pub webhook_secret: String,

    /// ISO 4217 currency code
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Hosted checkout page
    #[serde(default = "default_checkout_base_url")]
    pub checkout_base_url: String,

    /// Per-call processor timeout
    #[serde(default = "default_processor_timeout_seconds")]
    pub processor_timeout_seconds: u64,
}

impl fmt::Debug for PaymentsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentsConfig")
            .field("webhook_secret", &"[REDACTED]")
            .field("currency", &self.currency)
            .field("checkout_base_url", &self.checkout_base_url)
            .field("processor_timeout_seconds", &self.processor_timeout_seconds)
            .finish()
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
            currency: default_currency(),
            checkout_base_url: default_checkout_base_url(),
            processor_timeout_seconds: default_processor_timeout_seconds(),
        }
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_checkout_base_url() -> String {
    "https://checkout.invalid/pay".to_string()
}

fn default_processor_timeout_seconds() -> u64 {
    20
}

impl Config {
    /// Load configuration from default locations, falling back to defaults
    /// when no file exists.
    pub fn load() -> crate::Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// First existing config file among the default locations.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("labslot").join(CONFIG_FILE_NAME))
            .filter(|path| path.is_file())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(display.clone())
            } else {
                ConfigError::ReadFailed(display.clone(), e.to_string())
            }
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> crate::Result<()> {
        let mut problems = Vec::new();
        if self.general.log_level.parse::<crate::logging::LogLevel>().is_err() {
            problems.push(format!("general.log_level: unknown level {}", self.general.log_level));
        }
        if self.storage.busy_timeout_ms == 0 {
            problems.push("storage.busy_timeout_ms must be positive".to_string());
        }
        if self.scheduler.lookahead_minutes < 0 {
            problems.push("scheduler.lookahead_minutes must not be negative".to_string());
        }
        if self.reaper.grace_minutes <= 0 {
            problems.push("reaper.grace_minutes must be positive".to_string());
        }
        if self.runtime.timeout_seconds == 0 {
            problems.push("runtime.timeout_seconds must be positive".to_string());
        }
        if self.runtime.mode == RuntimeMode::Http {
            match self.runtime.base_url.as_deref() {
                None | Some("") => {
                    problems.push("runtime.base_url is required in http mode".to_string());
                }
                Some(base) if url::Url::parse(base).is_err() => {
                    problems.push(format!("runtime.base_url is not a valid URL: {base}"));
                }
                Some(_) => {}
            }
        }
        if self.payments.processor_timeout_seconds == 0 {
            problems.push("payments.processor_timeout_seconds must be positive".to_string());
        }
        if self.payments.currency.len() != 3
            || !self.payments.currency.chars().all(|c| c.is_ascii_uppercase())
        {
            problems.push(format!(
                "payments.currency must be a 3-letter ISO code, got {}",
                self.payments.currency
            ));
        }
        if url::Url::parse(&self.payments.checkout_base_url).is_err() {
            problems.push(format!(
                "payments.checkout_base_url is not a valid URL: {}",
                self.payments.checkout_base_url
            ));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError(problems.join("; ")).into())
        }
    }

    /// Logging settings derived from `[general]`
    #[must_use]
    pub fn log_config(&self) -> crate::logging::LogConfig {
        crate::logging::LogConfig {
            level: self.general.log_level.clone(),
            format: self.general.log_format,
            file: self.general.log_file.clone(),
        }
    }

    /// Reaper batch limit, with 0 meaning unbounded
    #[must_use]
    pub fn reaper_batch_limit(&self) -> Option<usize> {
        (self.reaper.batch_limit > 0).then_some(self.reaper.batch_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.scheduler.lookahead_minutes, 15);
        assert_eq!(config.reaper.grace_minutes, 15);
        assert_eq!(config.reaper.interval_seconds, 300);
        assert_eq!(config.runtime.timeout_seconds, 20);
        assert_eq!(config.payments.currency, "USD");
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [reaper]
            grace_minutes = 30

            [payments]
            webhook_secret = "whsec"
            "#,
        )
        .unwrap();
        assert_eq!(config.reaper.grace_minutes, 30);
        assert_eq!(config.reaper.interval_seconds, 300);
        assert_eq!(config.payments.webhook_secret, "whsec");
        assert_eq!(config.runtime.mode, RuntimeMode::Simulated);
    }

    #[test]
    fn http_mode_requires_base_url() {
        let err = Config::from_toml("[runtime]\nmode = \"http\"\n").unwrap_err();
        match err {
            Error::Config(ConfigError::ValidationError(msg)) => {
                assert!(msg.contains("runtime.base_url"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        Config::from_toml("[runtime]\nmode = \"http\"\nbase_url = \"http://127.0.0.1:9000\"\n")
            .unwrap();
    }

    #[test]
    fn validation_collects_every_problem() {
        let err = Config::from_toml(
            "[general]\nlog_level = \"loud\"\n[payments]\ncurrency = \"usd\"\n",
        )
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("general.log_level"));
        assert!(text.contains("payments.currency"));
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(matches!(
            Config::from_toml("[reaper\n").unwrap_err(),
            Error::Config(ConfigError::ParseFailed(_))
        ));
    }

    #[test]
    fn missing_file_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let mut config = Config::default();
        config.runtime.token = Some("tok-123".into());
        config.payments.webhook_secret = "whsec-456".into();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("tok-123"));
        assert!(!rendered.contains("whsec-456"));
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn zero_batch_limit_is_unbounded() {
        let mut config = Config::default();
        assert_eq!(config.reaper_batch_limit(), None);
        config.reaper.batch_limit = 50;
        assert_eq!(config.reaper_batch_limit(), Some(50));
    }
}
