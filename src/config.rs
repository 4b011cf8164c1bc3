//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound on the default pool size.
const MAX_DEFAULT_WORKERS: usize = 4;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers to spawn.
    pub pool_size: usize,
    /// Maximum number of queued jobs before the least urgent one is evicted.
    pub max_queue_size: usize,
    /// Payloads larger than this are estimated without a worker round-trip.
    pub max_payload_bytes: usize,
    /// Wall-clock limit for a dispatched job.
    pub job_timeout: Duration,
    /// How long to wait for WORKER_READY after spawning.
    pub ready_timeout: Duration,
    /// How long to wait for INIT_COMPLETE after INIT.
    pub init_timeout: Duration,
    /// Interval between health sweeps.
    pub health_check_interval: Duration,
    /// How long a worker has to answer a health probe.
    pub health_check_timeout: Duration,
    /// Sliding window for crash counting.
    pub failure_window: Duration,
    /// Crashes within the window that retire a worker permanently.
    pub max_failures_in_window: usize,
    /// Pause between failed respawn attempts.
    pub recovery_backoff: Duration,
    /// Memory-pressure and idle recycling.
    pub recycle: RecycleConfig,
}

/// Recycling thresholds and drain behaviour.
#[derive(Debug, Clone)]
pub struct RecycleConfig {
    /// Recycle when reported memory usage reaches this many bytes.
    pub memory_threshold_bytes: Option<u64>,
    /// Recycle after this long without new submissions.
    pub idle_after: Option<Duration>,
    /// Poll interval while waiting for active jobs to drain.
    pub drain_poll_interval: Duration,
    /// Consecutive unchanged polls after which remaining jobs count as stuck.
    pub drain_stable_checks: u32,
    /// Hard ceiling on the drain wait.
    pub drain_ceiling: Duration,
}

impl Default for RecycleConfig {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: None,
            idle_after: None,
            drain_poll_interval: Duration::from_millis(100),
            drain_stable_checks: 10,
            drain_ceiling: Duration::from_secs(5),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let pool_size = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(2)
            .clamp(1, MAX_DEFAULT_WORKERS);

        Self {
            pool_size,
            max_queue_size: 1000,
            max_payload_bytes: 10 * 1024 * 1024,
            job_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            failure_window: Duration::from_secs(60),
            max_failures_in_window: 3,
            recovery_backoff: Duration::from_millis(100),
            recycle: RecycleConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Load configuration from `TOKEN_POOL_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse::<usize>(&lookup, "TOKEN_POOL_SIZE")? {
            config.pool_size = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "TOKEN_POOL_MAX_QUEUE")? {
            config.max_queue_size = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "TOKEN_POOL_MAX_PAYLOAD_BYTES")? {
            config.max_payload_bytes = v;
        }
        if let Some(v) = parse_millis(&lookup, "TOKEN_POOL_JOB_TIMEOUT_MS")? {
            config.job_timeout = v;
        }
        if let Some(v) = parse_millis(&lookup, "TOKEN_POOL_READY_TIMEOUT_MS")? {
            config.ready_timeout = v;
        }
        if let Some(v) = parse_millis(&lookup, "TOKEN_POOL_INIT_TIMEOUT_MS")? {
            config.init_timeout = v;
        }
        if let Some(v) = parse_millis(&lookup, "TOKEN_POOL_HEALTH_INTERVAL_MS")? {
            config.health_check_interval = v;
        }
        if let Some(v) = parse_millis(&lookup, "TOKEN_POOL_HEALTH_TIMEOUT_MS")? {
            config.health_check_timeout = v;
        }
        if let Some(v) = parse_millis(&lookup, "TOKEN_POOL_FAILURE_WINDOW_MS")? {
            config.failure_window = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "TOKEN_POOL_MAX_FAILURES")? {
            config.max_failures_in_window = v;
        }
        if let Some(v) = parse_millis(&lookup, "TOKEN_POOL_RECOVERY_BACKOFF_MS")? {
            config.recovery_backoff = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "TOKEN_POOL_RECYCLE_MEMORY_BYTES")? {
            config.recycle.memory_threshold_bytes = Some(v);
        }
        if let Some(v) = parse_millis(&lookup, "TOKEN_POOL_RECYCLE_IDLE_MS")? {
            config.recycle.idle_after = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(invalid("pool_size", "must be at least 1"));
        }
        if self.max_queue_size == 0 {
            return Err(invalid("max_queue_size", "must be at least 1"));
        }
        if self.max_failures_in_window == 0 {
            return Err(invalid("max_failures_in_window", "must be at least 1"));
        }
        let durations = [
            ("job_timeout", self.job_timeout),
            ("ready_timeout", self.ready_timeout),
            ("init_timeout", self.init_timeout),
            ("health_check_interval", self.health_check_interval),
            ("health_check_timeout", self.health_check_timeout),
            ("failure_window", self.failure_window),
            ("recycle.drain_poll_interval", self.recycle.drain_poll_interval),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                return Err(invalid(key, "must be greater than zero"));
            }
        }
        if self.recycle.drain_stable_checks == 0 {
            return Err(invalid("recycle.drain_stable_checks", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::ParseError {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}
