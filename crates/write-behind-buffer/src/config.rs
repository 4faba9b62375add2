//! Buffer configuration.

use crate::error::{BufferError, BufferResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration shared by both engines and the background tasks around them.
///
/// Every field has a default, so a JSON file only needs the fields it changes.
///
/// # Backoff Calculation
///
/// A nacked message that still has retries left becomes eligible again after
/// `retry_base_delay * 2^retry_count`, capped at `retry_max_delay`, where
/// `retry_count` is the count *before* the failed attempt is recorded.
/// With the defaults:
/// - 1st failure: 1s
/// - 2nd failure: 2s
/// - 3rd failure: 4s
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Live messages (MAIN + INFLIGHT + RETRY) the buffer will hold.
    pub max_capacity: usize,
    /// Failed attempts allowed before a message is dead-lettered.
    pub max_retries: u32,
    /// Messages per consume call in the worker and shutdown drain.
    pub batch_size: usize,
    /// How long a message may sit in INFLIGHT before it is redriven.
    pub inflight_timeout_ms: u64,
    /// How long shutdown waits for in-progress offers to finish.
    pub shutdown_await_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Messages moved per rollover or redrive sweep.
    pub recovery_batch_size: usize,
    pub retry_sweep_interval_ms: u64,
    pub redrive_sweep_interval_ms: u64,
    /// Prefix for distributed keys. Wrapped in a hash tag.
    pub namespace: String,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            max_retries: 3,
            batch_size: 100,
            inflight_timeout_ms: 60_000,
            shutdown_await_timeout_ms: 10_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 300_000,
            recovery_batch_size: 100,
            retry_sweep_interval_ms: 10_000,
            redrive_sweep_interval_ms: 60_000,
            namespace: "buffer".to_string(),
        }
    }
}

impl BufferConfig {
    /// Defaults overridden by `BUFFER_*` environment variables.
    pub fn from_env() -> BufferResult<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file, then apply environment overrides.
    pub fn load_from_file(path: &Path) -> BufferResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> BufferResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Overlay `BUFFER_*` environment variables onto this config.
    pub fn apply_env(&mut self) {
        env_override("BUFFER_MAX_CAPACITY", &mut self.max_capacity);
        env_override("BUFFER_MAX_RETRIES", &mut self.max_retries);
        env_override("BUFFER_BATCH_SIZE", &mut self.batch_size);
        env_override("BUFFER_INFLIGHT_TIMEOUT_MS", &mut self.inflight_timeout_ms);
        env_override("BUFFER_SHUTDOWN_AWAIT_TIMEOUT_MS", &mut self.shutdown_await_timeout_ms);
        env_override("BUFFER_RETRY_BASE_DELAY_MS", &mut self.retry_base_delay_ms);
        env_override("BUFFER_RETRY_MAX_DELAY_MS", &mut self.retry_max_delay_ms);
        env_override("BUFFER_RECOVERY_BATCH_SIZE", &mut self.recovery_batch_size);
        env_override("BUFFER_RETRY_SWEEP_INTERVAL_MS", &mut self.retry_sweep_interval_ms);
        env_override("BUFFER_REDRIVE_SWEEP_INTERVAL_MS", &mut self.redrive_sweep_interval_ms);
        if let Ok(ns) = std::env::var("BUFFER_NAMESPACE") {
            self.namespace = ns;
        }
    }

    pub fn validate(&self) -> BufferResult<()> {
        if self.max_capacity == 0 {
            return Err(BufferError::Config("max_capacity must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(BufferError::Config("batch_size must be > 0".into()));
        }
        if self.recovery_batch_size == 0 {
            return Err(BufferError::Config("recovery_batch_size must be > 0".into()));
        }
        for (name, value) in [
            ("inflight_timeout_ms", self.inflight_timeout_ms),
            ("retry_sweep_interval_ms", self.retry_sweep_interval_ms),
            ("redrive_sweep_interval_ms", self.redrive_sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(BufferError::Config(format!("{} must be > 0", name)));
            }
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(BufferError::Config(
                "retry_max_delay_ms must be >= retry_base_delay_ms".into(),
            ));
        }
        if self.namespace.is_empty() || self.namespace.contains(['{', '}']) {
            return Err(BufferError::Config(
                "namespace must be non-empty and must not contain braces".into(),
            ));
        }
        Ok(())
    }

    pub fn inflight_timeout(&self) -> Duration {
        Duration::from_millis(self.inflight_timeout_ms)
    }

    pub fn shutdown_await_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_await_timeout_ms)
    }

    pub fn retry_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.retry_sweep_interval_ms)
    }

    pub fn redrive_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.redrive_sweep_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

fn env_override<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Some(value) = std::env::var(name).ok().and_then(|s| s.parse().ok()) {
        *target = value;
    }
}

/// Retry ceiling and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Whether a message that has already failed `retry_count` times and
    /// just failed again should be dead-lettered.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Delay before a message with `retry_count` prior failures is retried.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let multiplier = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }
}

/// Milliseconds in `duration`, saturating at `i64::MAX`.
pub(crate) fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// `now + delay`, clamped to the latest representable instant.
pub(crate) fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = BufferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.inflight_timeout(), Duration::from_secs(60));
        assert_eq!(config.namespace, "buffer");
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let config = BufferConfig {
            max_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BufferError::Config(_))));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let retry = BufferConfig {
            retry_sweep_interval_ms: 0,
            ..Default::default()
        };
        let redrive = BufferConfig {
            redrive_sweep_interval_ms: 0,
            ..Default::default()
        };
        let inflight = BufferConfig {
            inflight_timeout_ms: 0,
            ..Default::default()
        };
        for config in [retry, redrive, inflight] {
            assert!(matches!(config.validate(), Err(BufferError::Config(_))));
        }
    }

    #[test]
    fn test_zero_interval_in_file_is_rejected() {
        let config: BufferConfig =
            serde_json::from_str(r#"{"redrive_sweep_interval_ms": 0}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("redrive_sweep_interval_ms"));
    }

    #[test]
    fn test_time_arithmetic_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1_500)), 1_500);
        assert_eq!(duration_ms(Duration::from_millis(u64::MAX)), i64::MAX);
        assert_eq!(duration_ms(Duration::MAX), i64::MAX);

        let now = Utc::now();
        assert_eq!(
            deadline_after(now, Duration::from_secs(2)),
            now + chrono::Duration::seconds(2)
        );
        assert_eq!(deadline_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            deadline_after(now, Duration::from_millis(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_max_delay_below_base_is_rejected() {
        let config = BufferConfig {
            retry_base_delay_ms: 5_000,
            retry_max_delay_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_braced_namespace_is_rejected() {
        let config = BufferConfig {
            namespace: "{evil}".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BufferConfig = serde_json::from_str(r#"{"max_capacity": 5}"#).unwrap();
        assert_eq!(config.max_capacity, 5);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("buffer.json");
        let config = BufferConfig {
            max_capacity: 42,
            namespace: "orders".into(),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();

        let loaded = BufferConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.max_capacity, 42);
        assert_eq!(loaded.namespace, "orders");
    }

    #[test]
    fn test_backoff_doubles_per_retry() {
        let policy = BufferConfig::default().retry_policy();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = BufferConfig::default().retry_policy();
        assert_eq!(policy.backoff(20), Duration::from_secs(300));
        assert_eq!(policy.backoff(200), Duration::from_secs(300));
    }

    #[test]
    fn test_exhaustion_threshold() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(1));
        assert!(policy.is_exhausted(2));
    }
}
