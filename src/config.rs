use crate::executor::ExecutorSettings;
use crate::jobs::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "LEADRUN_CONFIG";
pub const DB_PATH_ENV: &str = "LEADRUN_DB_PATH";
pub const WORKERS_ENV: &str = "LEADRUN_WORKERS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub pause: PauseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "d_db_path")]
    pub path: PathBuf,
    #[serde(default = "d_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: d_db_path(),
            busy_timeout_ms: d_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Seconds a running step may go without reporting before it is stale.
    #[serde(default = "d_900")]
    pub stale_step_timeout_secs: u64,
    #[serde(default = "d_3600")]
    pub sender_stale_timeout_secs: u64,
    #[serde(default = "d_3")]
    pub max_step_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stale_step_timeout_secs: d_900(),
            sender_stale_timeout_secs: d_3600(),
            max_step_attempts: d_3(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "d_workers")]
    pub workers: usize,
    #[serde(default = "d_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "d_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "d_retry_max_secs")]
    pub retry_max_secs: u64,
    #[serde(default = "d_3")]
    pub max_attempts: u32,
    #[serde(default = "d_paused_max_attempts")]
    pub paused_max_attempts: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: d_workers(),
            poll_ms: d_poll_ms(),
            retry_base_secs: d_retry_base_secs(),
            retry_max_secs: d_retry_max_secs(),
            max_attempts: d_3(),
            paused_max_attempts: d_paused_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_sweep_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "d_sweep_batch")]
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: d_sweep_interval_secs(),
            batch_size: d_sweep_batch(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseConfig {
    /// Delay before a job that found execution paused is tried again.
    #[serde(default = "d_300")]
    pub requeue_interval_secs: u64,
    #[serde(default)]
    pub flag_file: Option<PathBuf>,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            requeue_interval_secs: d_300(),
            flag_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is unset.
    #[serde(default = "d_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: d_log_filter(),
            json: false,
        }
    }
}

fn d_db_path() -> PathBuf {
    PathBuf::from("leadrun.sqlite3")
}
fn d_busy_timeout_ms() -> u64 {
    5_000
}
fn d_900() -> u64 {
    900
}
fn d_3600() -> u64 {
    3600
}
fn d_300() -> u64 {
    300
}
fn d_3() -> u32 {
    3
}
fn d_workers() -> usize {
    2
}
fn d_poll_ms() -> u64 {
    500
}
fn d_retry_base_secs() -> u64 {
    10
}
fn d_retry_max_secs() -> u64 {
    600
}
fn d_paused_max_attempts() -> u32 {
    10_000
}
fn d_true() -> bool {
    true
}
fn d_sweep_interval_secs() -> u64 {
    60
}
fn d_sweep_batch() -> usize {
    200
}
fn d_log_filter() -> String {
    "leadrun=info".to_string()
}

impl EngineConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Loads the file named by `explicit`, else `LEADRUN_CONFIG`, else
    /// defaults, then applies environment overrides.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(DB_PATH_ENV).filter(|value| !value.trim().is_empty()) {
            self.database.path = PathBuf::from(path);
        }
        if let Some(value) = lookup(WORKERS_ENV) {
            self.jobs.workers = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|workers| *workers > 0)
                .ok_or(ConfigError::Env {
                    var: WORKERS_ENV,
                    value,
                })?;
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.database.busy_timeout_ms)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            stale_step_timeout: Duration::from_secs(self.executor.stale_step_timeout_secs),
            sender_stale_timeout: Duration::from_secs(self.executor.sender_stale_timeout_secs),
            max_step_attempts: i64::from(self.executor.max_step_attempts.max(1)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(self.jobs.retry_base_secs),
            max_delay: Duration::from_secs(self.jobs.retry_max_secs),
            max_attempts: self.jobs.max_attempts.max(1),
            paused_interval: self.paused_interval(),
            paused_max_attempts: self.jobs.paused_max_attempts,
        }
    }

    pub fn paused_interval(&self) -> Duration {
        Duration::from_secs(self.pause.requeue_interval_secs)
    }
}
