//! # Settings Module
//!
//! Unified configuration management with TOML support and environment overrides.
//!
//! ## Overview
//!
//! - **TOML file support**: Load and save configuration from/to TOML files
//! - **Environment variables**: Override settings via `AGENT_BUS_` prefixed env vars
//! - **Validation**: Ensure configuration consistency before the bus starts
//! - **Builder pattern**: Fluent API for constructing settings
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use agent_bus::settings::{Settings, Environment};
//!
//! let mut settings = Settings::load_from_file("agent-bus.toml")?;
//! settings.merge_with_env();
//!
//! let settings = Settings::builder()
//!     .environment(Environment::Production)
//!     .default_rate(200.0)
//!     .persistence_dir("/var/lib/agent-bus")
//!     .build();
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `AGENT_BUS_ENVIRONMENT` | `general.environment` |
//! | `AGENT_BUS_DEBUG` | `general.debug` |
//! | `AGENT_BUS_HISTORY_SIZE` | `bus.history_size` |
//! | `AGENT_BUS_RATE_LIMIT_ENABLED` | `rate_limit.enabled` |
//! | `AGENT_BUS_DEFAULT_RATE` | `rate_limit.default_rate` |
//! | `AGENT_BUS_DEFAULT_CAPACITY` | `rate_limit.default_capacity` |
//! | `AGENT_BUS_FAILURE_THRESHOLD` | `circuit_breaker.failure_threshold` |
//! | `AGENT_BUS_RESET_TIMEOUT_SECS` | `circuit_breaker.reset_timeout_secs` |
//! | `AGENT_BUS_PERSISTENCE_ENABLED` | `persistence.enabled` |
//! | `AGENT_BUS_PERSISTENCE_DIR` | `persistence.directory` |
//! | `AGENT_BUS_MAX_RETRIES` | `agents.max_retries` |
//! | `AGENT_BUS_LOG_LEVEL` | `logging.level` |
//! | `AGENT_BUS_LOG_FORMAT` | `logging.format` |
//!
//! ## Configuration File Example
//!
//! ```toml
//! [general]
//! environment = "production"
//!
//! [bus]
//! history_size = 5000
//! offline_after_secs = 90
//!
//! [rate_limit]
//! default_rate = 50.0
//! default_capacity = 100.0
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! reset_timeout_secs = 30
//!
//! [persistence]
//! enabled = true
//! directory = "./data/messages"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use crate::constants::*;
use crate::rate_limiter::RateLimitConfig;
use crate::recovery::{CircuitBreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during settings operations.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read or write a configuration file.
    #[error("Failed to read configuration file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse TOML content.
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to serialize to TOML.
    #[error("Failed to serialize to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Validation error in settings.
    #[error("Settings validation failed: {0}")]
    Validation(String),

    /// Invalid setting key.
    #[error("Invalid setting key: {0}")]
    InvalidKey(String),

    /// Type conversion error.
    #[error("Type conversion error for key '{key}': {message}")]
    TypeConversion { key: String, message: String },
}

/// Result type for settings operations.
pub type SettingsResult<T> = Result<T, SettingsError>;

impl From<SettingsError> for crate::Error {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::TypeConversion { key, message } => crate::Error::ConfigInvalidValue {
                key,
                details: message,
            },
            SettingsError::TomlParse(e) => crate::Error::Toml(e),
            other => crate::Error::Config(other.to_string()),
        }
    }
}

// ============================================================================
// Environment Enum
// ============================================================================

/// Runtime environment classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    /// Parse environment from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Some(Environment::Development),
            "staging" | "stage" => Some(Environment::Staging),
            "production" | "prod" => Some(Environment::Production),
            _ => None,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Log Level / Format Enums
// ============================================================================

/// Logging verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parse log level from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" | "text" | "plain" => Some(LogFormat::Pretty),
            _ => None,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, LogFormat::Json)
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Settings Sections
// ============================================================================

/// General application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub name: String,
    pub environment: Environment,
    pub debug: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            name: "agent-bus".to_string(),
            environment: Environment::Development,
            debug: false,
        }
    }
}

/// Message bus timers and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSettings {
    /// Maximum number of messages kept in history.
    pub history_size: usize,
    pub history_ttl_secs: u64,
    pub idempotency_ttl_secs: u64,
    /// Interval between heartbeat monitor scans.
    pub heartbeat_check_secs: u64,
    /// Silence after which an agent is flagged offline.
    pub offline_after_secs: u64,
    pub cleanup_interval_secs: u64,
    /// How long a command may wait for rate-limit tokens.
    pub admission_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            history_size: DEFAULT_HISTORY_SIZE,
            history_ttl_secs: DEFAULT_HISTORY_TTL_SECS,
            idempotency_ttl_secs: DEFAULT_IDEMPOTENCY_TTL_SECS,
            heartbeat_check_secs: DEFAULT_HEARTBEAT_CHECK_SECS,
            offline_after_secs: DEFAULT_OFFLINE_AFTER_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            admission_timeout_ms: DEFAULT_ADMISSION_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

/// Token bucket defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    /// Tokens per second.
    pub default_rate: f64,
    pub default_capacity: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rate: DEFAULT_BUCKET_RATE,
            default_capacity: DEFAULT_BUCKET_CAPACITY,
        }
    }
}

/// Circuit breaker tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub half_open_success_threshold: u32,
    pub half_open_admit_ratio: f64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_secs: DEFAULT_RESET_TIMEOUT_SECS,
            half_open_success_threshold: DEFAULT_HALF_OPEN_SUCCESSES,
            half_open_admit_ratio: DEFAULT_HALF_OPEN_ADMIT_RATIO,
        }
    }
}

/// Durable message store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub directory: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: DEFAULT_PERSISTENCE_DIR.to_string(),
        }
    }
}

/// Agent protocol settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub heartbeat_interval_secs: u64,
    pub command_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retry_jitter: f64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            response_timeout_secs: DEFAULT_RESPONSE_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            retry_jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub format: LogFormat,
}

// ============================================================================
// Main Settings Structure
// ============================================================================

/// Unified configuration for the bus, its agents and the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub bus: BusSettings,
    pub rate_limit: RateLimitSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub persistence: PersistenceSettings,
    pub agents: AgentSettings,
    pub logging: LoggingSettings,
}

fn parse_value<T: FromStr>(key: &str, value: &str, kind: &str) -> SettingsResult<T> {
    value.parse().map_err(|_| SettingsError::TypeConversion {
        key: key.to_string(),
        message: format!("Invalid {}: {}", kind, value),
    })
}

fn env_override<T: FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = env::var(name) {
        if let Ok(v) = raw.parse() {
            *slot = v;
        }
    }
}

impl Settings {
    /// Create a new SettingsBuilder for fluent configuration.
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::new()
    }

    /// Load settings from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> SettingsResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::load_from_toml(&content)
    }

    /// Load settings from a TOML string. Missing keys take their defaults.
    ///
    /// ```rust
    /// use agent_bus::settings::Settings;
    ///
    /// let settings = Settings::load_from_toml("[rate_limit]\ndefault_rate = 10.0").unwrap();
    /// assert_eq!(settings.rate_limit.default_rate, 10.0);
    /// assert_eq!(settings.rate_limit.default_capacity, 100.0);
    /// ```
    pub fn load_from_toml(content: &str) -> SettingsResult<Self> {
        let parsed: PartialSettings = toml::from_str(content)?;
        Ok(parsed.into_settings())
    }

    /// Defaults overlaid with `AGENT_BUS_*` environment variables.
    pub fn load_from_env() -> Self {
        let mut settings = Self::default();
        settings.merge_with_env();
        settings
    }

    /// Merge current settings with environment variable overrides.
    ///
    /// Environment variables take precedence; unparseable values are ignored.
    pub fn merge_with_env(&mut self) {
        // General
        if let Ok(name) = env::var("AGENT_BUS_NAME") {
            self.general.name = name;
        }
        if let Ok(env_str) = env::var("AGENT_BUS_ENVIRONMENT") {
            if let Some(environment) = Environment::from_str(&env_str) {
                self.general.environment = environment;
            }
        }
        env_override("AGENT_BUS_DEBUG", &mut self.general.debug);

        // Bus
        env_override("AGENT_BUS_HISTORY_SIZE", &mut self.bus.history_size);
        env_override("AGENT_BUS_HISTORY_TTL_SECS", &mut self.bus.history_ttl_secs);
        env_override("AGENT_BUS_IDEMPOTENCY_TTL_SECS", &mut self.bus.idempotency_ttl_secs);
        env_override("AGENT_BUS_HEARTBEAT_CHECK_SECS", &mut self.bus.heartbeat_check_secs);
        env_override("AGENT_BUS_OFFLINE_AFTER_SECS", &mut self.bus.offline_after_secs);
        env_override("AGENT_BUS_CLEANUP_INTERVAL_SECS", &mut self.bus.cleanup_interval_secs);
        env_override("AGENT_BUS_ADMISSION_TIMEOUT_MS", &mut self.bus.admission_timeout_ms);
        env_override("AGENT_BUS_SHUTDOWN_GRACE_MS", &mut self.bus.shutdown_grace_ms);

        // Rate limiting
        env_override("AGENT_BUS_RATE_LIMIT_ENABLED", &mut self.rate_limit.enabled);
        env_override("AGENT_BUS_DEFAULT_RATE", &mut self.rate_limit.default_rate);
        env_override("AGENT_BUS_DEFAULT_CAPACITY", &mut self.rate_limit.default_capacity);

        // Circuit breaker
        env_override(
            "AGENT_BUS_FAILURE_THRESHOLD",
            &mut self.circuit_breaker.failure_threshold,
        );
        env_override(
            "AGENT_BUS_RESET_TIMEOUT_SECS",
            &mut self.circuit_breaker.reset_timeout_secs,
        );

        // Persistence
        env_override("AGENT_BUS_PERSISTENCE_ENABLED", &mut self.persistence.enabled);
        if let Ok(dir) = env::var("AGENT_BUS_PERSISTENCE_DIR") {
            self.persistence.directory = dir;
        }

        // Agents
        env_override(
            "AGENT_BUS_HEARTBEAT_INTERVAL_SECS",
            &mut self.agents.heartbeat_interval_secs,
        );
        env_override(
            "AGENT_BUS_RESPONSE_TIMEOUT_SECS",
            &mut self.agents.response_timeout_secs,
        );
        env_override("AGENT_BUS_MAX_RETRIES", &mut self.agents.max_retries);

        // Logging
        if let Ok(level) = env::var("AGENT_BUS_LOG_LEVEL") {
            if let Some(l) = LogLevel::from_str(&level) {
                self.logging.level = l;
            }
        }
        if let Ok(format) = env::var("AGENT_BUS_LOG_FORMAT") {
            if let Some(f) = LogFormat::from_str(&format) {
                self.logging.format = f;
            }
        }
    }

    /// Save settings to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> SettingsResult<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get a setting value by dot-notation key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.to_map().remove(key)
    }

    /// Set a setting value by dot-notation key.
    ///
    /// ```rust
    /// use agent_bus::settings::Settings;
    ///
    /// let mut settings = Settings::default();
    /// settings.set("circuit_breaker.failure_threshold", "7").unwrap();
    /// assert_eq!(settings.circuit_breaker.failure_threshold, 7);
    /// assert!(settings.set("bus.history_size", "lots").is_err());
    /// ```
    pub fn set(&mut self, key: &str, value: &str) -> SettingsResult<()> {
        match key {
            // General
            "general.name" => self.general.name = value.to_string(),
            "general.environment" => {
                self.general.environment = Environment::from_str(value).ok_or_else(|| {
                    SettingsError::TypeConversion {
                        key: key.to_string(),
                        message: format!("Invalid environment: {}", value),
                    }
                })?
            }
            "general.debug" => self.general.debug = parse_value(key, value, "bool")?,

            // Bus
            "bus.history_size" => self.bus.history_size = parse_value(key, value, "usize")?,
            "bus.history_ttl_secs" => self.bus.history_ttl_secs = parse_value(key, value, "u64")?,
            "bus.idempotency_ttl_secs" => {
                self.bus.idempotency_ttl_secs = parse_value(key, value, "u64")?
            }
            "bus.heartbeat_check_secs" => {
                self.bus.heartbeat_check_secs = parse_value(key, value, "u64")?
            }
            "bus.offline_after_secs" => {
                self.bus.offline_after_secs = parse_value(key, value, "u64")?
            }
            "bus.cleanup_interval_secs" => {
                self.bus.cleanup_interval_secs = parse_value(key, value, "u64")?
            }
            "bus.admission_timeout_ms" => {
                self.bus.admission_timeout_ms = parse_value(key, value, "u64")?
            }
            "bus.shutdown_grace_ms" => self.bus.shutdown_grace_ms = parse_value(key, value, "u64")?,

            // Rate limiting
            "rate_limit.enabled" => self.rate_limit.enabled = parse_value(key, value, "bool")?,
            "rate_limit.default_rate" => {
                self.rate_limit.default_rate = parse_value(key, value, "f64")?
            }
            "rate_limit.default_capacity" => {
                self.rate_limit.default_capacity = parse_value(key, value, "f64")?
            }

            // Circuit breaker
            "circuit_breaker.failure_threshold" => {
                self.circuit_breaker.failure_threshold = parse_value(key, value, "u32")?
            }
            "circuit_breaker.reset_timeout_secs" => {
                self.circuit_breaker.reset_timeout_secs = parse_value(key, value, "u64")?
            }
            "circuit_breaker.half_open_success_threshold" => {
                self.circuit_breaker.half_open_success_threshold = parse_value(key, value, "u32")?
            }
            "circuit_breaker.half_open_admit_ratio" => {
                self.circuit_breaker.half_open_admit_ratio = parse_value(key, value, "f64")?
            }

            // Persistence
            "persistence.enabled" => self.persistence.enabled = parse_value(key, value, "bool")?,
            "persistence.directory" => self.persistence.directory = value.to_string(),

            // Agents
            "agents.heartbeat_interval_secs" => {
                self.agents.heartbeat_interval_secs = parse_value(key, value, "u64")?
            }
            "agents.command_timeout_secs" => {
                self.agents.command_timeout_secs = parse_value(key, value, "u64")?
            }
            "agents.response_timeout_secs" => {
                self.agents.response_timeout_secs = parse_value(key, value, "u64")?
            }
            "agents.max_retries" => self.agents.max_retries = parse_value(key, value, "u32")?,
            "agents.base_delay_ms" => self.agents.base_delay_ms = parse_value(key, value, "u64")?,
            "agents.max_delay_ms" => self.agents.max_delay_ms = parse_value(key, value, "u64")?,
            "agents.retry_jitter" => self.agents.retry_jitter = parse_value(key, value, "f64")?,

            // Logging
            "logging.level" => {
                self.logging.level =
                    LogLevel::from_str(value).ok_or_else(|| SettingsError::TypeConversion {
                        key: key.to_string(),
                        message: format!("Invalid log level: {}", value),
                    })?
            }
            "logging.format" => {
                self.logging.format =
                    LogFormat::from_str(value).ok_or_else(|| SettingsError::TypeConversion {
                        key: key.to_string(),
                        message: format!("Invalid log format: {}", value),
                    })?
            }

            _ => return Err(SettingsError::InvalidKey(key.to_string())),
        }
        Ok(())
    }

    /// Validate all settings for consistency and correctness.
    ///
    /// All problems are collected and reported together.
    pub fn validate(&self) -> SettingsResult<()> {
        let mut errors = Vec::new();

        if self.general.name.is_empty() {
            errors.push("general.name cannot be empty");
        }

        if self.bus.history_size == 0 {
            errors.push("bus.history_size must be > 0");
        }
        if self.bus.heartbeat_check_secs == 0 {
            errors.push("bus.heartbeat_check_secs must be > 0");
        }
        if self.bus.offline_after_secs == 0 {
            errors.push("bus.offline_after_secs must be > 0");
        }
        if self.bus.cleanup_interval_secs == 0 {
            errors.push("bus.cleanup_interval_secs must be > 0");
        }

        if !(self.rate_limit.default_rate > 0.0) {
            errors.push("rate_limit.default_rate must be > 0");
        }
        if !(self.rate_limit.default_capacity > 0.0) {
            errors.push("rate_limit.default_capacity must be > 0");
        }

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be > 0");
        }
        if self.circuit_breaker.half_open_success_threshold == 0 {
            errors.push("circuit_breaker.half_open_success_threshold must be > 0");
        }
        if !(0.0..=1.0).contains(&self.circuit_breaker.half_open_admit_ratio) {
            errors.push("circuit_breaker.half_open_admit_ratio must be within [0, 1]");
        }

        if self.persistence.enabled && self.persistence.directory.is_empty() {
            errors.push("persistence.directory cannot be empty when persistence is enabled");
        }

        if self.agents.heartbeat_interval_secs == 0 {
            errors.push("agents.heartbeat_interval_secs must be > 0");
        }
        if self.agents.response_timeout_secs == 0 {
            errors.push("agents.response_timeout_secs must be > 0");
        }
        if self.agents.base_delay_ms > self.agents.max_delay_ms {
            errors.push("agents.base_delay_ms must not exceed agents.max_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.agents.retry_jitter) {
            errors.push("agents.retry_jitter must be within [0, 1]");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Validation(errors.join("; ")))
        }
    }

    /// Get all settings as a flat key-value map with dot-notation keys.
    pub fn to_map(&self) -> HashMap<String, String> {
        let entries: Vec<(&str, String)> = vec![
            ("general.name", self.general.name.clone()),
            ("general.environment", self.general.environment.to_string()),
            ("general.debug", self.general.debug.to_string()),
            ("bus.history_size", self.bus.history_size.to_string()),
            ("bus.history_ttl_secs", self.bus.history_ttl_secs.to_string()),
            ("bus.idempotency_ttl_secs", self.bus.idempotency_ttl_secs.to_string()),
            ("bus.heartbeat_check_secs", self.bus.heartbeat_check_secs.to_string()),
            ("bus.offline_after_secs", self.bus.offline_after_secs.to_string()),
            ("bus.cleanup_interval_secs", self.bus.cleanup_interval_secs.to_string()),
            ("bus.admission_timeout_ms", self.bus.admission_timeout_ms.to_string()),
            ("bus.shutdown_grace_ms", self.bus.shutdown_grace_ms.to_string()),
            ("rate_limit.enabled", self.rate_limit.enabled.to_string()),
            ("rate_limit.default_rate", self.rate_limit.default_rate.to_string()),
            ("rate_limit.default_capacity", self.rate_limit.default_capacity.to_string()),
            (
                "circuit_breaker.failure_threshold",
                self.circuit_breaker.failure_threshold.to_string(),
            ),
            (
                "circuit_breaker.reset_timeout_secs",
                self.circuit_breaker.reset_timeout_secs.to_string(),
            ),
            (
                "circuit_breaker.half_open_success_threshold",
                self.circuit_breaker.half_open_success_threshold.to_string(),
            ),
            (
                "circuit_breaker.half_open_admit_ratio",
                self.circuit_breaker.half_open_admit_ratio.to_string(),
            ),
            ("persistence.enabled", self.persistence.enabled.to_string()),
            ("persistence.directory", self.persistence.directory.clone()),
            (
                "agents.heartbeat_interval_secs",
                self.agents.heartbeat_interval_secs.to_string(),
            ),
            ("agents.command_timeout_secs", self.agents.command_timeout_secs.to_string()),
            ("agents.response_timeout_secs", self.agents.response_timeout_secs.to_string()),
            ("agents.max_retries", self.agents.max_retries.to_string()),
            ("agents.base_delay_ms", self.agents.base_delay_ms.to_string()),
            ("agents.max_delay_ms", self.agents.max_delay_ms.to_string()),
            ("agents.retry_jitter", self.agents.retry_jitter.to_string()),
            ("logging.level", self.logging.level.to_string()),
            ("logging.format", self.logging.format.to_string()),
        ];
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    /// Production preset: persistence on, JSON logs at warn level, larger history.
    pub fn production() -> Self {
        Self {
            general: GeneralSettings {
                environment: Environment::Production,
                debug: false,
                ..Default::default()
            },
            bus: BusSettings {
                history_size: 10_000,
                ..Default::default()
            },
            persistence: PersistenceSettings {
                enabled: true,
                ..Default::default()
            },
            logging: LoggingSettings {
                level: LogLevel::Warn,
                format: LogFormat::Json,
            },
            ..Default::default()
        }
    }

    /// Development preset: debug logging, no persistence.
    pub fn development() -> Self {
        Self {
            general: GeneralSettings {
                environment: Environment::Development,
                debug: true,
                ..Default::default()
            },
            logging: LoggingSettings {
                level: LogLevel::Debug,
                format: LogFormat::Pretty,
            },
            ..Default::default()
        }
    }

    /// Persistence directory when persistence is enabled.
    pub fn persistence_dir(&self) -> Option<PathBuf> {
        self.persistence
            .enabled
            .then(|| PathBuf::from(&self.persistence.directory))
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            default_rate: self.rate_limit.default_rate,
            default_capacity: self.rate_limit.default_capacity,
            enabled: self.rate_limit.enabled,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            reset_timeout: Duration::from_secs(self.circuit_breaker.reset_timeout_secs),
            half_open_success_threshold: self.circuit_breaker.half_open_success_threshold,
            half_open_admit_ratio: self.circuit_breaker.half_open_admit_ratio,
        }
    }
}

impl RetryConfig {
    /// Retry policy from the `[agents]` section.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.agents.max_retries,
            base_delay_ms: settings.agents.base_delay_ms,
            max_delay_ms: settings.agents.max_delay_ms,
            jitter: settings.agents.retry_jitter,
        }
    }
}

// ============================================================================
// Partial Settings for TOML Parsing
// ============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialSettings {
    #[serde(default)]
    general: PartialGeneralSettings,
    #[serde(default)]
    bus: PartialBusSettings,
    #[serde(default)]
    rate_limit: PartialRateLimitSettings,
    #[serde(default)]
    circuit_breaker: PartialCircuitBreakerSettings,
    #[serde(default)]
    persistence: PartialPersistenceSettings,
    #[serde(default)]
    agents: PartialAgentSettings,
    #[serde(default)]
    logging: PartialLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialGeneralSettings {
    name: Option<String>,
    environment: Option<Environment>,
    debug: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialBusSettings {
    history_size: Option<usize>,
    history_ttl_secs: Option<u64>,
    idempotency_ttl_secs: Option<u64>,
    heartbeat_check_secs: Option<u64>,
    offline_after_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    admission_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialRateLimitSettings {
    enabled: Option<bool>,
    default_rate: Option<f64>,
    default_capacity: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialCircuitBreakerSettings {
    failure_threshold: Option<u32>,
    reset_timeout_secs: Option<u64>,
    half_open_success_threshold: Option<u32>,
    half_open_admit_ratio: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialPersistenceSettings {
    enabled: Option<bool>,
    directory: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialAgentSettings {
    heartbeat_interval_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    response_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    retry_jitter: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialLoggingSettings {
    level: Option<LogLevel>,
    format: Option<LogFormat>,
}

impl PartialSettings {
    fn into_settings(self) -> Settings {
        let d = Settings::default();
        let (g, b, r, c, p, a, l) = (
            self.general,
            self.bus,
            self.rate_limit,
            self.circuit_breaker,
            self.persistence,
            self.agents,
            self.logging,
        );

        Settings {
            general: GeneralSettings {
                name: g.name.unwrap_or(d.general.name),
                environment: g.environment.unwrap_or(d.general.environment),
                debug: g.debug.unwrap_or(d.general.debug),
            },
            bus: BusSettings {
                history_size: b.history_size.unwrap_or(d.bus.history_size),
                history_ttl_secs: b.history_ttl_secs.unwrap_or(d.bus.history_ttl_secs),
                idempotency_ttl_secs: b
                    .idempotency_ttl_secs
                    .unwrap_or(d.bus.idempotency_ttl_secs),
                heartbeat_check_secs: b
                    .heartbeat_check_secs
                    .unwrap_or(d.bus.heartbeat_check_secs),
                offline_after_secs: b.offline_after_secs.unwrap_or(d.bus.offline_after_secs),
                cleanup_interval_secs: b
                    .cleanup_interval_secs
                    .unwrap_or(d.bus.cleanup_interval_secs),
                admission_timeout_ms: b
                    .admission_timeout_ms
                    .unwrap_or(d.bus.admission_timeout_ms),
                shutdown_grace_ms: b.shutdown_grace_ms.unwrap_or(d.bus.shutdown_grace_ms),
            },
            rate_limit: RateLimitSettings {
                enabled: r.enabled.unwrap_or(d.rate_limit.enabled),
                default_rate: r.default_rate.unwrap_or(d.rate_limit.default_rate),
                default_capacity: r.default_capacity.unwrap_or(d.rate_limit.default_capacity),
            },
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: c
                    .failure_threshold
                    .unwrap_or(d.circuit_breaker.failure_threshold),
                reset_timeout_secs: c
                    .reset_timeout_secs
                    .unwrap_or(d.circuit_breaker.reset_timeout_secs),
                half_open_success_threshold: c
                    .half_open_success_threshold
                    .unwrap_or(d.circuit_breaker.half_open_success_threshold),
                half_open_admit_ratio: c
                    .half_open_admit_ratio
                    .unwrap_or(d.circuit_breaker.half_open_admit_ratio),
            },
            persistence: PersistenceSettings {
                enabled: p.enabled.unwrap_or(d.persistence.enabled),
                directory: p.directory.unwrap_or(d.persistence.directory),
            },
            agents: AgentSettings {
                heartbeat_interval_secs: a
                    .heartbeat_interval_secs
                    .unwrap_or(d.agents.heartbeat_interval_secs),
                command_timeout_secs: a
                    .command_timeout_secs
                    .unwrap_or(d.agents.command_timeout_secs),
                response_timeout_secs: a
                    .response_timeout_secs
                    .unwrap_or(d.agents.response_timeout_secs),
                max_retries: a.max_retries.unwrap_or(d.agents.max_retries),
                base_delay_ms: a.base_delay_ms.unwrap_or(d.agents.base_delay_ms),
                max_delay_ms: a.max_delay_ms.unwrap_or(d.agents.max_delay_ms),
                retry_jitter: a.retry_jitter.unwrap_or(d.agents.retry_jitter),
            },
            logging: LoggingSettings {
                level: l.level.unwrap_or(d.logging.level),
                format: l.format.unwrap_or(d.logging.format),
            },
        }
    }
}

// ============================================================================
// Settings Builder
// ============================================================================

/// Fluent builder for constructing Settings.
///
/// ```rust
/// use agent_bus::settings::{SettingsBuilder, Environment, LogLevel};
///
/// let settings = SettingsBuilder::new()
///     .environment(Environment::Production)
///     .failure_threshold(3)
///     .log_level(LogLevel::Warn)
///     .build();
///
/// assert_eq!(settings.circuit_breaker.failure_threshold, 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.general.name = name.into();
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.settings.general.environment = environment;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.settings.general.debug = debug;
        self
    }

    pub fn history_size(mut self, size: usize) -> Self {
        self.settings.bus.history_size = size;
        self
    }

    pub fn offline_after_secs(mut self, secs: u64) -> Self {
        self.settings.bus.offline_after_secs = secs;
        self
    }

    pub fn rate_limiting(mut self, enabled: bool) -> Self {
        self.settings.rate_limit.enabled = enabled;
        self
    }

    pub fn default_rate(mut self, rate: f64) -> Self {
        self.settings.rate_limit.default_rate = rate;
        self
    }

    pub fn default_capacity(mut self, capacity: f64) -> Self {
        self.settings.rate_limit.default_capacity = capacity;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.settings.circuit_breaker.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout_secs(mut self, secs: u64) -> Self {
        self.settings.circuit_breaker.reset_timeout_secs = secs;
        self
    }

    /// Enable persistence under `dir`.
    pub fn persistence_dir(mut self, dir: impl Into<String>) -> Self {
        self.settings.persistence.enabled = true;
        self.settings.persistence.directory = dir.into();
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.settings.agents.max_retries = retries;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.settings.logging.level = level;
        self
    }

    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.settings.logging.format = format;
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }

    /// Build and validate the Settings instance.
    pub fn build_validated(self) -> SettingsResult<Settings> {
        let settings = self.settings;
        settings.validate()?;
        Ok(settings)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ========================================================================
    // Enum Tests
    // ========================================================================

    #[test]
    fn test_environment_from_str() {
        assert_eq!(Environment::from_str("dev"), Some(Environment::Development));
        assert_eq!(Environment::from_str("STAGE"), Some(Environment::Staging));
        assert_eq!(Environment::from_str("prod"), Some(Environment::Production));
        assert_eq!(Environment::from_str("invalid"), None);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("loud"), None);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!(LogFormat::from_str("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_str("text"), Some(LogFormat::Pretty));
        assert!(LogFormat::Json.is_json());
        assert!(!LogFormat::default().is_json());
    }

    // ========================================================================
    // Defaults & Presets
    // ========================================================================

    #[test]
    fn test_settings_default_matches_constants() {
        let settings = Settings::default();
        assert_eq!(settings.rate_limit.default_rate, DEFAULT_BUCKET_RATE);
        assert_eq!(settings.rate_limit.default_capacity, DEFAULT_BUCKET_CAPACITY);
        assert_eq!(settings.circuit_breaker.failure_threshold, 5);
        assert_eq!(settings.circuit_breaker.reset_timeout_secs, 30);
        assert_eq!(settings.bus.history_size, 1_000);
        assert!(!settings.persistence.enabled);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let prod = Settings::production();
        assert!(prod.general.environment.is_production());
        assert!(prod.persistence.enabled);
        assert_eq!(prod.logging.format, LogFormat::Json);
        assert!(prod.validate().is_ok());

        let dev = Settings::development();
        assert!(dev.general.debug);
        assert_eq!(dev.logging.level, LogLevel::Debug);
    }

    // ========================================================================
    // TOML Loading
    // ========================================================================

    #[test]
    fn test_load_from_toml_complete_sections() {
        let toml = r#"
            [general]
            name = "fleet"
            environment = "staging"

            [bus]
            history_size = 50
            offline_after_secs = 10

            [rate_limit]
            enabled = false
            default_rate = 5.0

            [circuit_breaker]
            failure_threshold = 2
            half_open_admit_ratio = 0.5

            [persistence]
            enabled = true
            directory = "/tmp/store"

            [agents]
            max_retries = 1
            retry_jitter = 0.0

            [logging]
            level = "debug"
            format = "json"
        "#;
        let settings = Settings::load_from_toml(toml).unwrap();
        assert_eq!(settings.general.name, "fleet");
        assert_eq!(settings.general.environment, Environment::Staging);
        assert_eq!(settings.bus.history_size, 50);
        assert_eq!(settings.bus.offline_after_secs, 10);
        assert_eq!(settings.bus.cleanup_interval_secs, DEFAULT_CLEANUP_INTERVAL_SECS);
        assert!(!settings.rate_limit.enabled);
        assert_eq!(settings.rate_limit.default_rate, 5.0);
        assert_eq!(settings.circuit_breaker.failure_threshold, 2);
        assert_eq!(settings.circuit_breaker.half_open_admit_ratio, 0.5);
        assert_eq!(settings.persistence_dir(), Some(PathBuf::from("/tmp/store")));
        assert_eq!(settings.agents.max_retries, 1);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_from_toml_empty() {
        let settings = Settings::load_from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_from_toml_invalid() {
        let result = Settings::load_from_toml("[bus\nhistory_size = ");
        assert!(matches!(result, Err(SettingsError::TomlParse(_))));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent-bus.toml");
        let settings = Settings::builder()
            .name("saved")
            .failure_threshold(9)
            .persistence_dir("/data")
            .build();

        settings.save_to_file(&path).unwrap();
        let loaded = Settings::load_from_file(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_load_file_not_found() {
        let result = Settings::load_from_file("/nonexistent/agent-bus.toml");
        assert!(matches!(result, Err(SettingsError::FileRead(_))));
    }

    // ========================================================================
    // Environment Overrides
    // ========================================================================

    #[test]
    fn test_merge_with_env() {
        env::set_var("AGENT_BUS_DEFAULT_RATE", "12.5");
        env::set_var("AGENT_BUS_FAILURE_THRESHOLD", "not-a-number");
        env::set_var("AGENT_BUS_PERSISTENCE_DIR", "/env/store");

        let mut settings = Settings::default();
        settings.merge_with_env();

        env::remove_var("AGENT_BUS_DEFAULT_RATE");
        env::remove_var("AGENT_BUS_FAILURE_THRESHOLD");
        env::remove_var("AGENT_BUS_PERSISTENCE_DIR");

        assert_eq!(settings.rate_limit.default_rate, 12.5);
        assert_eq!(
            settings.circuit_breaker.failure_threshold,
            DEFAULT_FAILURE_THRESHOLD
        );
        assert_eq!(settings.persistence.directory, "/env/store");
    }

    // ========================================================================
    // Get / Set / Map
    // ========================================================================

    #[test]
    fn test_get_and_set() {
        let mut settings = Settings::default();
        assert_eq!(settings.get("general.name"), Some("agent-bus".to_string()));
        assert_eq!(settings.get("invalid.key"), None);

        settings.set("rate_limit.default_capacity", "250").unwrap();
        assert_eq!(settings.get("rate_limit.default_capacity"), Some("250".to_string()));

        settings.set("logging.level", "error").unwrap();
        assert_eq!(settings.logging.level, LogLevel::Error);
    }

    #[test]
    fn test_set_errors() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.set("bogus.key", "1"),
            Err(SettingsError::InvalidKey(_))
        ));
        assert!(matches!(
            settings.set("agents.max_retries", "-1"),
            Err(SettingsError::TypeConversion { .. })
        ));
        assert!(matches!(
            settings.set("general.environment", "moon"),
            Err(SettingsError::TypeConversion { .. })
        ));
    }

    #[test]
    fn test_to_map_round_trips_through_set() {
        let original = Settings::production();
        let mut rebuilt = Settings::default();
        for (key, value) in original.to_map() {
            rebuilt.set(&key, &value).unwrap();
        }
        assert_eq!(rebuilt, original);
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn test_validate_collects_all_errors() {
        let mut settings = Settings::default();
        settings.rate_limit.default_rate = 0.0;
        settings.circuit_breaker.half_open_admit_ratio = 1.5;
        settings.agents.base_delay_ms = 20_000;

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("rate_limit.default_rate"));
        assert!(err.contains("half_open_admit_ratio"));
        assert!(err.contains("base_delay_ms"));
    }

    #[test]
    fn test_builder_validated_failure() {
        let result = Settings::builder().failure_threshold(0).build_validated();
        assert!(matches!(result, Err(SettingsError::Validation(_))));
    }

    // ========================================================================
    // Runtime Bridges
    // ========================================================================

    #[test]
    fn test_runtime_configs_from_settings() {
        let settings = Settings::builder()
            .default_rate(10.0)
            .default_capacity(20.0)
            .reset_timeout_secs(2)
            .max_retries(7)
            .build();

        let limiter = settings.rate_limit_config();
        assert_eq!(limiter.default_rate, 10.0);
        assert_eq!(limiter.default_capacity, 20.0);

        let breaker = settings.circuit_breaker_config();
        assert_eq!(breaker.reset_timeout, Duration::from_secs(2));

        let retry = RetryConfig::from_settings(&settings);
        assert_eq!(retry.max_retries, 7);
        assert_eq!(retry.base_delay_ms, DEFAULT_BASE_DELAY_MS);
    }

    #[test]
    fn test_settings_error_converts() {
        let err: crate::Error = SettingsError::Validation("bad".into()).into();
        assert_eq!(err.code(), "E004");
        let err: crate::Error = SettingsError::TypeConversion {
            key: "bus.history_size".into(),
            message: "Invalid usize".into(),
        }
        .into();
        assert_eq!(err.code(), "E003");
    }
}
