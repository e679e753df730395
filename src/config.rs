use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::errors::QueueError;

/// Minute-valued settings above this are treated as malformed.
const MAX_INTERVAL_MINUTES: u64 = 366 * 24 * 60;

/// Runtime tunables for the job engine, read from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_count: usize,
    /// 0 means unbounded.
    pub queue_capacity: usize,
    pub default_max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    pub retry_backoff_jitter: f64,
    pub progress_throttle: Duration,
    pub fallback_sync_interval: Duration,
    pub deployment_check_interval: Option<Duration>,
    pub job_timeout: Option<Duration>,
    pub job_history_capacity: usize,
    pub bind_addr: SocketAddr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            queue_capacity: 0,
            default_max_retries: 3,
            retry_backoff_base: Duration::from_millis(1_000),
            retry_backoff_max: Duration::from_millis(300_000),
            retry_backoff_jitter: 0.1,
            progress_throttle: Duration::from_millis(100),
            fallback_sync_interval: Duration::from_secs(15 * 60),
            deployment_check_interval: None,
            job_timeout: None,
            job_history_capacity: 200,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let fallback_minutes: u64 = env_or("FALLBACK_SYNC_INTERVAL_MINUTES", 15);
        let deployment_minutes: u64 = env_or("DEPLOYMENT_CHECK_MINUTES", 0);
        let timeout_seconds: u64 = env_or("JOB_TIMEOUT_SECONDS", 0);

        Self {
            worker_count: env_or("WORKER_COUNT", defaults.worker_count),
            queue_capacity: env_or("QUEUE_CAPACITY", defaults.queue_capacity),
            default_max_retries: env_or("JOB_MAX_RETRIES", defaults.default_max_retries),
            retry_backoff_base: Duration::from_millis(env_or("RETRY_BACKOFF_BASE_MS", 1_000)),
            retry_backoff_max: Duration::from_millis(env_or("RETRY_BACKOFF_MAX_MS", 300_000)),
            retry_backoff_jitter: env_or("RETRY_BACKOFF_JITTER", defaults.retry_backoff_jitter),
            progress_throttle: Duration::from_millis(env_or("PROGRESS_THROTTLE_MS", 100)),
            fallback_sync_interval: minutes_to_duration("FALLBACK_SYNC_INTERVAL_MINUTES", fallback_minutes)
                .unwrap_or(defaults.fallback_sync_interval),
            deployment_check_interval: minutes_to_duration("DEPLOYMENT_CHECK_MINUTES", deployment_minutes)
                .filter(|interval| !interval.is_zero()),
            job_timeout: (timeout_seconds > 0).then(|| Duration::from_secs(timeout_seconds)),
            job_history_capacity: env_or("JOB_HISTORY_CAPACITY", defaults.job_history_capacity),
            bind_addr: env_or("BIND_ADDR", defaults.bind_addr),
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.worker_count == 0 {
            return Err(QueueError::Config("WORKER_COUNT must be at least 1".to_string()));
        }
        if self.retry_backoff_max < self.retry_backoff_base {
            return Err(QueueError::Config(
                "RETRY_BACKOFF_MAX_MS must not be smaller than RETRY_BACKOFF_BASE_MS".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry_backoff_jitter) {
            return Err(QueueError::Config(
                "RETRY_BACKOFF_JITTER must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.fallback_sync_interval < Duration::from_secs(60) {
            return Err(QueueError::Config(
                "FALLBACK_SYNC_INTERVAL_MINUTES must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reads `key` and parses it, falling back to `default` when the variable is
/// missing or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key = key, value = %raw, "Invalid value in environment, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// `None` (with a warning) when `minutes` exceeds a year.
fn minutes_to_duration(key: &str, minutes: u64) -> Option<Duration> {
    if minutes > MAX_INTERVAL_MINUTES {
        warn!(key = key, minutes, "Interval out of range, using default");
        return None;
    }
    Some(Duration::from_secs(minutes * 60))
}
