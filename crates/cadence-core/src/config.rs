use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_LOG_LIMIT: usize = 50;
pub const MAX_LOG_LIMIT: usize = 500;
pub const DEFAULT_LOG_FILTER: &str = "cadence_daemon=info,cadence_scheduler=info";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// Create the directory holding the database file if it does not exist.
    pub fn ensure_parent_dir(&self) -> crate::error::Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Retry, fan-out and read-side limits for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Attempts per execution chain before the task is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before attempt `k + 1` is `2^k * backoff_base_ms`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Buffered `task_update` events per subscriber before it lags.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_log_limit")]
    pub default_log_limit: usize,
    #[serde(default = "default_max_log_limit")]
    pub max_log_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            default_log_limit: DEFAULT_LOG_LIMIT,
            max_log_limit: MAX_LOG_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber` filter used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}
fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}
fn default_log_limit() -> usize {
    DEFAULT_LOG_LIMIT
}
fn default_max_log_limit() -> usize {
    MAX_LOG_LIMIT
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `CADENCE_SCHEDULER__MAX_ATTEMPTS=5` sets `scheduler.max_attempts`.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::from(Serialized::defaults(CadenceConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.scheduler.max_attempts == 0 {
            return Err(crate::error::CadenceError::Config(
                "scheduler.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.scheduler.event_capacity == 0 {
            return Err(crate::error::CadenceError::Config(
                "scheduler.event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
