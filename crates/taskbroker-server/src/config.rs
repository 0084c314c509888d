//! Broker configuration.
//!
//! Every setting is a CLI flag that can also be supplied through the
//! environment. Values are read once at startup.

use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

/// Broker configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "taskbroker", about = "Task broker for sandboxed script runners")]
pub struct Config {
    /// Address runners connect to.
    #[arg(long, env = "TASKBROKER_RUNNER_ADDR", default_value = "127.0.0.1:5679")]
    pub runner_addr: String,

    /// Address of the HTTP status and client API.
    #[arg(long, env = "TASKBROKER_HTTP_ADDR", default_value = "127.0.0.1:5680")]
    pub http_addr: String,

    /// Expected heartbeat interval from runners (seconds).
    #[arg(long, env = "TASKBROKER_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Silence after which a runner is considered dead (seconds).
    #[arg(long, env = "TASKBROKER_HEARTBEAT_TIMEOUT_SECS", default_value_t = 60)]
    pub heartbeat_timeout_secs: u64,

    /// Upper bound on the concurrency a runner may declare.
    #[arg(long, env = "TASKBROKER_MAX_CONCURRENCY", default_value_t = 5)]
    pub max_concurrency: u32,

    /// Default execution time limit for tasks (seconds, 0 disables).
    #[arg(long, env = "TASKBROKER_TASK_TIMEOUT_SECS", default_value_t = 60)]
    pub task_timeout_secs: u64,

    /// How long an offer may stay unanswered (milliseconds).
    #[arg(long, env = "TASKBROKER_OFFER_TIMEOUT_MS", default_value_t = 5_000)]
    pub offer_timeout_ms: u64,

    /// How long a runner that rejected a task is passed over for it (milliseconds).
    #[arg(long, env = "TASKBROKER_REJECT_BACKOFF_MS", default_value_t = 1_000)]
    pub reject_backoff_ms: u64,

    /// How long a runner gets to acknowledge a cancel (milliseconds).
    #[arg(long, env = "TASKBROKER_CANCEL_GRACE_MS", default_value_t = 5_000)]
    pub cancel_grace_ms: u64,

    /// Period of the offer/deadline/deferred-queue sweep (milliseconds).
    #[arg(long, env = "TASKBROKER_SWEEP_INTERVAL_MS", default_value_t = 1_000)]
    pub sweep_interval_ms: u64,

    /// How long finished tasks stay queryable (seconds).
    #[arg(long, env = "TASKBROKER_TASK_RETENTION_SECS", default_value_t = 300)]
    pub task_retention_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runner_addr: "127.0.0.1:5679".to_string(),
            http_addr: "127.0.0.1:5680".to_string(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_concurrency: 5,
            task_timeout_secs: 60,
            offer_timeout_ms: 5_000,
            reject_backoff_ms: 1_000,
            cancel_grace_ms: 5_000,
            sweep_interval_ms: 1_000,
            task_retention_secs: 300,
        }
    }
}

impl Config {
    /// Check settings that would make liveness detection meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "heartbeat timeout ({}s) must exceed heartbeat interval ({}s)",
                self.heartbeat_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max concurrency must be positive".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sweep interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Default task time limit, `None` when disabled.
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    pub fn reject_backoff(&self) -> Duration {
        Duration::from_millis(self.reject_backoff_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_cli_defaults() {
        let parsed = Config::parse_from(["taskbroker"]);
        let default = Config::default();
        assert_eq!(parsed.runner_addr, default.runner_addr);
        assert_eq!(parsed.heartbeat_interval_secs, default.heartbeat_interval_secs);
        assert_eq!(parsed.heartbeat_timeout_secs, default.heartbeat_timeout_secs);
        assert_eq!(parsed.max_concurrency, default.max_concurrency);
        assert_eq!(parsed.offer_timeout_ms, default.offer_timeout_ms);
        assert_eq!(parsed.reject_backoff_ms, default.reject_backoff_ms);
        assert!(default.validate().is_ok());
    }

    #[test]
    fn test_timeout_must_exceed_interval() {
        let config = Config {
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 10,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_task_timeout_disables_deadline() {
        let config = Config {
            task_timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.task_timeout().is_none());
        assert_eq!(Config::default().task_timeout(), Some(Duration::from_secs(60)));
    }
}
