//! Task lifecycle events.
//!
//! Liveness and timeout signals travel from the heartbeat monitor and the
//! sweeper to the broker's event loop over a dedicated channel. Each event
//! is delivered once and then dropped; nothing is persisted.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;

use taskbroker_core::{RunnerId, TaskId};

/// Capacity of the lifecycle channel.
pub const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

/// Why a runner failed its heartbeat check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatFailure {
    /// No heartbeat for longer than the heartbeat timeout.
    Missed { silent_for: Duration },
    /// The runner was suspect (task timeout or ignored cancel) and did not
    /// heartbeat within one interval.
    Unconfirmed,
}

/// A liveness or timeout notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `runner:failed-heartbeat-check`
    FailedHeartbeatCheck {
        runner_id: RunnerId,
        /// Sequence number of the registration that failed.
        registration: u64,
        cause: HeartbeatFailure,
    },
    /// `runner:timed-out-during-task`
    TimedOutDuringTask { task_id: TaskId, runner_id: RunnerId },
}

impl LifecycleEvent {
    /// Event name as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FailedHeartbeatCheck { .. } => "runner:failed-heartbeat-check",
            Self::TimedOutDuringTask { .. } => "runner:timed-out-during-task",
        }
    }

    /// The runner this event is about.
    pub fn runner_id(&self) -> &RunnerId {
        match self {
            Self::FailedHeartbeatCheck { runner_id, .. } => runner_id,
            Self::TimedOutDuringTask { runner_id, .. } => runner_id,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailedHeartbeatCheck {
                runner_id,
                registration,
                cause,
            } => write!(
                f,
                "{} runner={} registration={} cause={:?}",
                self.name(),
                runner_id,
                registration,
                cause
            ),
            Self::TimedOutDuringTask { task_id, runner_id } => {
                write!(f, "{} task={} runner={}", self.name(), task_id, runner_id)
            }
        }
    }
}

/// Sending half, held by the broker and cloned into the monitor loops.
pub type LifecycleSender = mpsc::Sender<LifecycleEvent>;

/// Receiving half, drained by the event loop.
pub type LifecycleReceiver = mpsc::Receiver<LifecycleEvent>;

/// Create the lifecycle channel.
pub fn channel() -> (LifecycleSender, LifecycleReceiver) {
    mpsc::channel(LIFECYCLE_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let hb = LifecycleEvent::FailedHeartbeatCheck {
            runner_id: RunnerId::new("r1"),
            registration: 3,
            cause: HeartbeatFailure::Unconfirmed,
        };
        let to = LifecycleEvent::TimedOutDuringTask {
            task_id: TaskId::new("t1"),
            runner_id: RunnerId::new("r2"),
        };
        assert_eq!(hb.name(), "runner:failed-heartbeat-check");
        assert_eq!(to.name(), "runner:timed-out-during-task");
        assert_eq!(to.runner_id().as_str(), "r2");
        assert!(to.to_string().contains("task=t1"));
        assert!(hb.to_string().contains("registration=3"));
    }
}
