//! Configuration management for the flowmill engine
//!
//! Handles server binding, store location and scheduler tuning. `Config::default()`
//! reads `FLOWMILL_*` environment variables so containers can override anything.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Scheduler configuration
    pub processor: ProcessorConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Flow store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx SQLite URL (default: "sqlite://data/flowmill.db")
    pub url: String,
    /// Lease on distributed lock rows; a crashed holder frees its keys after this
    pub lock_lease: Duration,
}

/// How many ready siblings of one run a single pass may dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SiblingDispatch {
    /// One task per run per pass; a run never has two ACTIVE task runs
    #[default]
    Serial,
    /// Every ready task at once; siblings of one run execute in parallel
    Concurrent,
}

impl std::str::FromStr for SiblingDispatch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(SiblingDispatch::Serial),
            "concurrent" => Ok(SiblingDispatch::Concurrent),
            other => Err(format!("unknown sibling dispatch mode: {}", other)),
        }
    }
}

/// Scheduler loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Sleep once before the first pass
    pub start_delay: Duration,
    /// Sleep between passes
    pub poll_interval: Duration,
    /// How long a pass waits for a run's lock before skipping the run
    pub lock_timeout: Duration,
    /// Upper bound on task executions in flight in this process
    pub max_in_flight: usize,
    pub sibling_dispatch: SiblingDispatch,
    /// ACTIVE task runs older than this, not executing in this process, are
    /// treated as abandoned by a crashed processor and deleted. Off when `None`.
    pub stale_task_run_after: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            lock_timeout: Duration::from_millis(100),
            max_in_flight: 256,
            sibling_dispatch: SiblingDispatch::Serial,
            stale_task_run_after: None,
        }
    }
}

impl ProcessorConfig {
    /// Defaults overridden by `FLOWMILL_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            start_delay: env_millis("FLOWMILL_START_DELAY_MS").unwrap_or(defaults.start_delay),
            poll_interval: env_millis("FLOWMILL_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            lock_timeout: env_millis("FLOWMILL_LOCK_TIMEOUT_MS").unwrap_or(defaults.lock_timeout),
            max_in_flight: env_parse("FLOWMILL_MAX_IN_FLIGHT").unwrap_or(defaults.max_in_flight),
            sibling_dispatch: env_parse("FLOWMILL_SIBLING_DISPATCH")
                .unwrap_or(defaults.sibling_dispatch),
            stale_task_run_after: env_parse::<u64>("FLOWMILL_STALE_TASK_RUN_SECS")
                .map(Duration::from_secs),
        }
    }

    /// No start delay and a short poll, for tests and batch draining
    pub fn immediate() -> Self {
        Self {
            start_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
            ..Self::default()
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FLOWMILL_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("FLOWMILL_PORT").unwrap_or(3004),
            },
            database: DatabaseConfig {
                url: std::env::var("FLOWMILL_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/flowmill.db".to_string()),
                lock_lease: env_millis("FLOWMILL_LOCK_LEASE_MS")
                    .unwrap_or(Duration::from_secs(30)),
            },
            processor: ProcessorConfig::from_env(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("⚠️ Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
