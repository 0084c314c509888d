//! Runner configuration.

use std::time::Duration;

use clap::Parser;

use taskbroker_core::{ModuleGuard, RunnerId, RunnerInfo, DEFAULT_TASK_TYPE};

use crate::error::RunnerError;

/// Runner configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "taskbroker-runner", about = "Executes broker tasks in a guarded Node.js process")]
pub struct Config {
    /// Broker runner endpoint.
    #[arg(long, env = "TASKBROKER_RUNNER_BROKER_ADDR", default_value = "127.0.0.1:5679")]
    pub broker_addr: String,

    /// Runner ID. A random one is generated when omitted.
    #[arg(long, env = "TASKBROKER_RUNNER_ID")]
    pub runner_id: Option<String>,

    /// Display name reported to the broker (defaults to the hostname).
    #[arg(long, env = "TASKBROKER_RUNNER_NAME")]
    pub name: Option<String>,

    /// Maximum number of tasks executed at once.
    #[arg(long, env = "TASKBROKER_RUNNER_MAX_CONCURRENCY", default_value_t = 5)]
    pub max_concurrency: u32,

    /// Heartbeat interval in seconds.
    #[arg(long, env = "TASKBROKER_RUNNER_HEARTBEAT_INTERVAL_SECS", default_value_t = 15)]
    pub heartbeat_interval_secs: u64,

    /// Reconnection delay on connection loss (seconds).
    #[arg(long, env = "TASKBROKER_RUNNER_RECONNECT_DELAY_SECS", default_value_t = 5)]
    pub reconnect_delay_secs: u64,

    /// Modules task code may import, comma separated. Empty allows all.
    #[arg(long, env = "NODE_FUNCTION_ALLOW_EXTERNAL", value_delimiter = ',')]
    pub allow_modules: Vec<String>,

    /// Modules task code may never import, comma separated.
    #[arg(long, env = "TASKBROKER_RUNNER_DENY_MODULES", value_delimiter = ',')]
    pub deny_modules: Vec<String>,

    /// Node.js interpreter.
    #[arg(long, env = "TASKBROKER_RUNNER_NODE", default_value = "node")]
    pub node_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_addr: "127.0.0.1:5679".to_string(),
            runner_id: None,
            name: None,
            max_concurrency: 5,
            heartbeat_interval_secs: 15,
            reconnect_delay_secs: 5,
            allow_modules: Vec::new(),
            deny_modules: Vec::new(),
            node_path: "node".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.max_concurrency == 0 {
            return Err(RunnerError::Config(
                "max concurrency must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(RunnerError::Config(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Fix the runner ID so reconnections reuse it.
    pub fn resolve_runner_id(mut self) -> Self {
        if self.runner_id.is_none() {
            self.runner_id = Some(RunnerId::generate().into_inner());
        }
        self
    }

    /// What this runner announces at registration.
    pub fn runner_info(&self) -> RunnerInfo {
        let runner_id = match &self.runner_id {
            Some(id) => RunnerId::new(id.clone()),
            None => RunnerId::generate(),
        };
        let name = self
            .name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| runner_id.to_string());

        RunnerInfo::new(runner_id, self.max_concurrency)
            .with_name(name)
            .with_task_types(vec![DEFAULT_TASK_TYPE.to_string()])
    }

    /// Module guard built from the configured lists.
    pub fn guard(&self) -> ModuleGuard {
        ModuleGuard::new(clean(&self.allow_modules), clean(&self.deny_modules))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

fn clean(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_lists_from_flags() {
        let config = Config::parse_from([
            "taskbroker-runner",
            "--allow-modules",
            "lodash, moment",
            "--deny-modules",
            "child_process",
        ]);
        let guard = config.guard();
        assert!(guard.is_allowed("lodash/fp"));
        assert!(guard.is_allowed("moment"));
        assert!(!guard.is_allowed("axios"));
        assert!(!guard.is_allowed("child_process"));
    }

    #[test]
    fn test_resolved_runner_id_is_stable() {
        let config = Config::default().resolve_runner_id();
        assert_eq!(config.runner_info().runner_id, config.runner_info().runner_id);
    }

    #[test]
    fn test_zero_concurrency_is_invalid() {
        let config = Config {
            max_concurrency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
