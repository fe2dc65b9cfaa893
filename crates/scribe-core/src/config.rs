use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections created eagerly and kept through idle reaping.
    pub min_size: usize,
    /// Hard cap on live connections (idle plus leased).
    pub max_size: usize,
    pub idle_timeout_ms: u64,
    /// How long `acquire` waits in the queue before failing.
    pub acquire_timeout_ms: u64,
    /// Base delay for exponential retry backoff.
    pub retry_delay_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            idle_timeout_ms: 30_000,
            acquire_timeout_ms: 5_000,
            retry_delay_ms: 1_000,
            max_retries: 3,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries older than this are treated as absent.
    pub max_age_ms: u64,
    pub max_size: usize,
    /// Serialized results larger than this many bytes are stored compressed.
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 300_000,
            max_size: 100,
            compression_threshold: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Undo entries kept; the oldest is dropped first.
    pub max_history: usize,
    /// Ask the remote validator before the first action of each query.
    pub validate_first_action: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_history: 50,
            validate_first_action: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Endpoint of the remote action validator; unset disables the check.
    pub url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema_value = config_schema_json();
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

/// Parse and schema-check TOML text, without environment overrides.
pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Table = toml::from_str(content).context("parse config toml")?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

/// Load a config file, then apply `SCRIBE_*` environment overrides.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let mut cfg = parse_config(&content)?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable config override");
            None
        }
    }
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(v) = env_parse::<usize>("SCRIBE_POOL_MAX_SIZE") {
        cfg.pool.max_size = v.max(1);
    }
    if let Some(v) = env_parse::<u64>("SCRIBE_POOL_ACQUIRE_TIMEOUT_MS") {
        cfg.pool.acquire_timeout_ms = v;
    }
    if let Some(v) = env_parse::<u32>("SCRIBE_POOL_MAX_RETRIES") {
        cfg.pool.max_retries = v;
    }
    if let Some(v) = env_parse::<u64>("SCRIBE_CACHE_MAX_AGE_MS") {
        cfg.cache.max_age_ms = v;
    }
    if let Some(v) = env_parse::<usize>("SCRIBE_CACHE_MAX_SIZE") {
        cfg.cache.max_size = v;
    }
    if let Ok(url) = std::env::var("SCRIBE_VALIDATOR_URL") {
        let url = url.trim();
        cfg.validator.url = if url.is_empty() {
            None
        } else {
            Some(url.to_string())
        };
    }
}
