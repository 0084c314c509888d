//! Status enum and transition table for Tasks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task in the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task created, admission not yet decided.
    #[default]
    Pending,
    /// Waiting in the FIFO queue for runner capacity.
    Deferred,
    /// A runner slot is reserved; waiting for the runner to accept.
    Offered,
    /// Runner accepted the task.
    Accepted,
    /// Runner reported that execution started.
    Running,
    /// Task produced a result.
    Succeeded,
    /// Task failed (user code, runner lost, or timeout).
    Failed,
    /// Task was cancelled by the client or withdrawn from the queue.
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 8] = [
        Self::Pending,
        Self::Deferred,
        Self::Offered,
        Self::Accepted,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true while a runner is executing (or about to execute) the task.
    pub fn is_executing(&self) -> bool {
        matches!(self, Self::Accepted | Self::Running)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Terminal states have no outgoing edges. `Offered -> Deferred` is the
    /// re-queue after a rejection when no other runner is eligible.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Offered | Deferred | Cancelled)
                | (Deferred, Offered | Cancelled)
                | (Offered, Accepted | Deferred | Cancelled)
                | (Accepted, Running | Succeeded | Failed | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
        )
    }

    /// Lowercase label, used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deferred => "deferred",
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in TaskStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn test_no_backward_from_execution() {
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Accepted));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Offered));
        assert!(!TaskStatus::Accepted.can_transition_to(TaskStatus::Deferred));
        assert!(!TaskStatus::Deferred.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            TaskStatus::Pending,
            TaskStatus::Deferred,
            TaskStatus::Offered,
            TaskStatus::Accepted,
            TaskStatus::Running,
            TaskStatus::Succeeded,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }
}
