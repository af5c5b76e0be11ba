//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Execution engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of jobs running at once.
    pub concurrency_limit: usize,
    /// Job-level retries when the task does not set its own.
    pub default_max_retries: u32,
    /// Delay before the queue is re-processed after a job finishes.
    pub requeue_delay: Duration,
    /// Pause between attempts of a step with the `retry` error policy.
    pub step_retry_delay: Duration,
    /// How often the health monitor scans workers.
    pub heartbeat_check_interval: Duration,
    /// Workers silent for longer than this are reaped as stuck.
    pub stale_worker_threshold: Duration,
    /// Broadcast channel capacity for engine events.
    pub event_capacity: usize,
    /// Capabilities advertised by every worker.
    pub worker_capabilities: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
            default_max_retries: 3,
            requeue_delay: Duration::from_millis(100),
            step_retry_delay: Duration::from_secs(1),
            heartbeat_check_interval: Duration::from_secs(60), // 1 minute
            stale_worker_threshold: Duration::from_secs(300),  // 5 minutes
            event_capacity: 256,
            worker_capabilities: vec!["browser".to_string(), "rpa".to_string()],
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let concurrency_limit =
            env_parse("RPA_CONCURRENCY_LIMIT").unwrap_or(defaults.concurrency_limit);
        let default_max_retries =
            env_parse("RPA_MAX_RETRIES").unwrap_or(defaults.default_max_retries);
        let requeue_delay = env_parse("RPA_REQUEUE_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.requeue_delay);
        let step_retry_delay = env_parse("RPA_STEP_RETRY_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.step_retry_delay);
        let heartbeat_check_interval = env_parse("RPA_HEARTBEAT_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_check_interval);
        let stale_worker_threshold = env_parse("RPA_STALE_WORKER_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.stale_worker_threshold);

        Self {
            concurrency_limit,
            default_max_retries,
            requeue_delay,
            step_retry_delay,
            heartbeat_check_interval,
            stale_worker_threshold,
            ..defaults
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "concurrency_limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.heartbeat_check_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_check_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency_limit, 3);
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.step_retry_delay, Duration::from_secs(1));
        assert_eq!(config.heartbeat_check_interval, Duration::from_secs(60));
        assert_eq!(config.stale_worker_threshold, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = EngineConfig {
            concurrency_limit: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "concurrency_limit"
        ));
    }

    #[test]
    fn zero_health_interval_is_rejected() {
        let config = EngineConfig {
            heartbeat_check_interval: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_parse_ignores_garbage() {
        assert_eq!(env_parse::<u32>("RPA_TEST_DEFINITELY_UNSET_VAR"), None);
    }
}
