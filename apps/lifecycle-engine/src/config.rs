//! Configuration loading, validation, and environment interpolation.
//!
//! Configuration is a single YAML document. `${VAR}` and `${VAR:-default}`
//! references are resolved against the process environment before parsing.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::RetryPolicy;
use crate::risk::RiskRule;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Validation failed.
    #[error("config validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Engine/orchestrator configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Pre-submit market-data gate configuration.
    #[serde(default)]
    pub gate: GateConfig,
    /// Market-data cache configuration.
    #[serde(default)]
    pub marketdata: MarketDataConfig,
    /// Execution/broker configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Risk rule configuration.
    #[serde(default)]
    pub risk: RiskConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default account orders run under.
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Delay between fill-status polls.
    #[serde(default = "default_fill_poll_interval_ms")]
    pub fill_poll_interval_ms: u64,
    /// Polls before an unfilled order is handed to the chase loop or
    /// reported as timed out.
    #[serde(default = "default_fill_poll_attempts")]
    pub fill_poll_attempts: u32,
    /// Limit-order chase behavior.
    #[serde(default)]
    pub chase: ChaseConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            account_id: default_account_id(),
            fill_poll_interval_ms: default_fill_poll_interval_ms(),
            fill_poll_attempts: default_fill_poll_attempts(),
            chase: ChaseConfig::default(),
        }
    }
}

fn default_account_id() -> String {
    "paper-account".to_string()
}
const fn default_fill_poll_interval_ms() -> u64 {
    250
}
const fn default_fill_poll_attempts() -> u32 {
    240
}

/// Limit-order chase configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaseConfig {
    /// Whether unfilled limit orders are re-priced toward the market.
    #[serde(default = "default_chase_enabled")]
    pub enabled: bool,
    /// Maximum re-price attempts before the order is left resting.
    #[serde(default = "default_chase_max_attempts")]
    pub max_attempts: u32,
    /// Price concession per attempt.
    #[serde(default = "default_chase_price_step")]
    pub price_step: Decimal,
    /// Wait between re-price attempts.
    #[serde(default = "default_chase_wait_ms")]
    pub wait_ms: u64,
}

impl Default for ChaseConfig {
    fn default() -> Self {
        Self {
            enabled: default_chase_enabled(),
            max_attempts: default_chase_max_attempts(),
            price_step: default_chase_price_step(),
            wait_ms: default_chase_wait_ms(),
        }
    }
}

const fn default_chase_enabled() -> bool {
    true
}
const fn default_chase_max_attempts() -> u32 {
    3
}
fn default_chase_price_step() -> Decimal {
    Decimal::new(5, 2) // 0.05
}
const fn default_chase_wait_ms() -> u64 {
    2000
}

/// Pre-submit gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Maximum quote age before a submission is refused.
    #[serde(default = "default_max_staleness_ms")]
    pub max_staleness_ms: i64,
    /// Tolerated drift between target and observed delta, in points.
    #[serde(default = "default_delta_tolerance_points")]
    pub delta_tolerance_points: Decimal,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_staleness_ms: default_max_staleness_ms(),
            delta_tolerance_points: default_delta_tolerance_points(),
        }
    }
}

const fn default_max_staleness_ms() -> i64 {
    500
}
fn default_delta_tolerance_points() -> Decimal {
    Decimal::from(2)
}

/// Market-data cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// Quote age at which a staleness alert fires.
    #[serde(default = "default_staleness_warn_threshold_ms")]
    pub staleness_warn_threshold_ms: i64,
    /// Interval of the background staleness sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            staleness_warn_threshold_ms: default_staleness_warn_threshold_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

const fn default_staleness_warn_threshold_ms() -> i64 {
    2000
}
const fn default_sweep_interval_ms() -> u64 {
    1000
}

/// Execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionConfig {
    /// Broker retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Broker retry configuration, in config-friendly units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts including the first.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff in milliseconds.
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_retry_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Exponential growth factor.
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    /// Jitter fraction, 0.0 to 1.0.
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            initial_backoff_ms: default_retry_initial_backoff_ms(),
            max_backoff_ms: default_retry_max_backoff_ms(),
            multiplier: default_retry_multiplier(),
            jitter: default_retry_jitter(),
        }
    }
}

const fn default_retry_max_attempts() -> u32 {
    3
}
const fn default_retry_initial_backoff_ms() -> u64 {
    200
}
const fn default_retry_max_backoff_ms() -> u64 {
    5000
}
const fn default_retry_multiplier() -> f64 {
    2.0
}
const fn default_retry_jitter() -> f64 {
    0.2
}

impl RetryConfig {
    /// Convert to the execution-layer retry policy.
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Risk rule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Rule set evaluated by default.
    #[serde(default = "default_rule_set")]
    pub active_rule_set: String,
    /// Configured rules across all rule sets.
    #[serde(default)]
    pub rules: Vec<RiskRule>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            active_rule_set: default_rule_set(),
            rules: Vec::new(),
        }
    }
}

fn default_rule_set() -> String {
    "default".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load configuration from a YAML file.
///
/// # Arguments
///
/// * `path` - Optional path to the config file. Defaults to "config.yaml".
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or
/// validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or("config.yaml");

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration from a YAML string.
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax. An unset variable
/// without a default resolves to the empty string.
#[allow(clippy::expect_used)] // regex pattern is a compile-time constant
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    let mut result = input.to_string();
    for cap in re.captures_iter(input) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let Some(var_match) = cap.get(1) else {
            continue;
        };
        let default_value = cap.get(2).map(|m| m.as_str());

        let value = match std::env::var(var_match.as_str()) {
            Ok(v) if !v.is_empty() => v,
            _ => default_value.map_or_else(String::new, str::to_string),
        };
        result = result.replace(full_match.as_str(), &value);
    }

    result
}

/// Validate configuration values.
fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.engine.fill_poll_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "engine.fill_poll_interval_ms must be positive".to_string(),
        ));
    }
    if config.engine.fill_poll_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "engine.fill_poll_attempts must be positive".to_string(),
        ));
    }
    if config.engine.chase.enabled {
        if config.engine.chase.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "engine.chase.max_attempts must be positive when chase is enabled".to_string(),
            ));
        }
        if config.engine.chase.price_step <= Decimal::ZERO {
            return Err(ConfigError::ValidationError(
                "engine.chase.price_step must be positive".to_string(),
            ));
        }
    }

    if config.gate.max_staleness_ms <= 0 {
        return Err(ConfigError::ValidationError(
            "gate.max_staleness_ms must be positive".to_string(),
        ));
    }
    if config.gate.delta_tolerance_points < Decimal::ZERO {
        return Err(ConfigError::ValidationError(
            "gate.delta_tolerance_points must be non-negative".to_string(),
        ));
    }

    if config.marketdata.staleness_warn_threshold_ms <= 0 {
        return Err(ConfigError::ValidationError(
            "marketdata.staleness_warn_threshold_ms must be positive".to_string(),
        ));
    }

    if config.execution.retry.max_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "execution.retry.max_attempts must be positive".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.execution.retry.jitter) {
        return Err(ConfigError::ValidationError(
            "execution.retry.jitter must be between 0.0 and 1.0".to_string(),
        ));
    }
    if config.execution.retry.multiplier < 1.0 {
        return Err(ConfigError::ValidationError(
            "execution.retry.multiplier must be at least 1.0".to_string(),
        ));
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::ValidationError(format!(
            "logging.level must be one of: {valid_levels:?}"
        )));
    }

    Ok(())
}
