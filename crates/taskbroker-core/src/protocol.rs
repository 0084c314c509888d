//! Messages exchanged between the broker and runner processes.
//!
//! Each message is one JSON object per line, tagged by `type`. The first
//! frame a runner sends on a new connection must be [`RunnerMessage::Register`].

use serde::{Deserialize, Serialize};

use crate::{CoreError, RunnerId, RunnerInfo, TaskError, TaskId, TaskPayload};

/// Runner -> broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    /// Announce the runner and its capacity.
    Register {
        runner_id: RunnerId,
        name: String,
        task_types: Vec<String>,
        max_concurrency: u32,
    },
    /// Periodic liveness signal.
    Heartbeat { runner_id: RunnerId },
    /// The runner takes an offered task.
    Accept { task_id: TaskId },
    /// The runner declines an offered task.
    Reject { task_id: TaskId, reason: String },
    /// Execution started.
    Started { task_id: TaskId },
    /// Execution produced a result.
    Done {
        task_id: TaskId,
        result: serde_json::Value,
    },
    /// Execution failed.
    Error { task_id: TaskId, error: TaskError },
    /// The runner stopped the task after a cancel request.
    Cancelled { task_id: TaskId },
}

impl RunnerMessage {
    /// Registration frame for the given runner.
    pub fn register(info: &RunnerInfo) -> Self {
        Self::Register {
            runner_id: info.runner_id.clone(),
            name: info.name.clone(),
            task_types: info.task_types.clone(),
            max_concurrency: info.max_concurrency,
        }
    }
}

/// Broker -> runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// Registration succeeded.
    Registered { runner_id: RunnerId },
    /// Registration failed; the broker closes the connection after this.
    RegistrationFailed { reason: String },
    /// A slot on the runner is reserved for this task; accept or reject it.
    Offer {
        task_id: TaskId,
        payload: TaskPayload,
        /// Execution time limit, counted from acceptance.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Stop working on the task.
    Cancel { task_id: TaskId, reason: String },
}

/// Encode one protocol frame (without the trailing newline).
pub fn encode<T: Serialize>(message: &T) -> Result<String, CoreError> {
    serde_json::to_string(message).map_err(|e| CoreError::Serialization(e.to_string()))
}

/// Decode one protocol frame.
pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, CoreError> {
    serde_json::from_str(line).map_err(|e| CoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_runner_message_tagging() {
        let line = encode(&RunnerMessage::Reject {
            task_id: TaskId::new("t1"),
            reason: "busy".into(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({ "type": "reject", "task_id": "t1", "reason": "busy" }));
    }

    #[test]
    fn test_decode_error_frame() {
        let msg: RunnerMessage = decode(
            r#"{"type":"error","task_id":"t9","error":{"kind":"disallowed_module","module":"fs"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            RunnerMessage::Error {
                task_id: TaskId::new("t9"),
                error: TaskError::DisallowedModule { module: "fs".into() },
            }
        );
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let err = decode::<BrokerMessage>("{not json").unwrap_err();
        assert!(matches!(err, CoreError::Serialization(_)));
    }

    #[test]
    fn test_offer_omits_missing_timeout() {
        let line = encode(&BrokerMessage::Offer {
            task_id: TaskId::new("t1"),
            payload: TaskPayload::new("return 1"),
            timeout_ms: None,
        })
        .unwrap();
        assert!(!line.contains("timeout_ms"));
    }
}
