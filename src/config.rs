//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Pool-wide configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Path of the job database (`:memory:` for an in-memory store).
    pub database_path: PathBuf,
    /// How often the reaper sweeps for stuck jobs and periodic jobs.
    pub reaper_interval: Duration,
    /// Upper bound for waiting on in-flight handlers during shutdown.
    /// `None` waits for the longest task lifetime.
    pub shutdown_grace: Option<Duration>,
    /// Finished jobs older than this are deleted by the cleanup task.
    pub retention: Duration,
    /// How often the cleanup task runs.
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/jobs.db"),
            reaper_interval: Duration::from_secs(5),
            shutdown_grace: None,
            retention: Duration::from_secs(7 * 24 * 3600), // 1 week
            cleanup_interval: Duration::from_secs(3600),   // 1 hour
        }
    }
}

impl PoolConfig {
    /// Build a config from `JOB_POOL_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup("JOB_POOL_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(ms) = parse_u64(&lookup, "JOB_POOL_REAPER_INTERVAL_MS")? {
            config.reaper_interval = non_zero("JOB_POOL_REAPER_INTERVAL_MS", Duration::from_millis(ms))?;
        }
        if let Some(ms) = parse_u64(&lookup, "JOB_POOL_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace = Some(Duration::from_millis(ms));
        }
        if let Some(secs) = parse_u64(&lookup, "JOB_POOL_RETENTION_SECS")? {
            config.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "JOB_POOL_CLEANUP_INTERVAL_SECS")? {
            config.cleanup_interval =
                non_zero("JOB_POOL_CLEANUP_INTERVAL_SECS", Duration::from_secs(secs))?;
        }

        Ok(config)
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

fn non_zero(key: &str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
