//! The task broker.
//!
//! [`Broker`] is a cheap, cloneable handle shared by runner connections, the
//! HTTP surface and the background loops. Each operation takes the state lock
//! once, commits its transition, and only then sends whatever runner messages
//! the transition produced.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskbroker_core::{
    BrokerMessage, RunnerId, RunnerInfo, Task, TaskId, TaskOutcome, TaskPayload, TaskRejectError,
};

use crate::config::Config;
use crate::error::BrokerError;
use crate::events::{self, LifecycleEvent, LifecycleReceiver, LifecycleSender};
use crate::state::{BrokerState, BrokerStats, Outbox, RunnerSnapshot, Subscription};

/// Capacity of each broker -> runner channel.
pub const RUNNER_CHANNEL_CAPACITY: usize = 64;

/// Returned by [`Broker::register`]: the runner's inbox.
pub struct RunnerHandle {
    pub runner_id: RunnerId,
    pub rx: mpsc::Receiver<BrokerMessage>,
}

struct Inner {
    state: Mutex<BrokerState>,
    events: LifecycleSender,
    config: Config,
}

/// Shared handle to the broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// Create a broker and the receiving end of its lifecycle channel.
    ///
    /// The receiver must be drained by [`crate::monitor::spawn`] (or by hand
    /// in tests via [`Broker::handle_event`]).
    pub fn new(config: Config) -> (Self, LifecycleReceiver) {
        let (events, rx) = events::channel();
        let broker = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::new(config.clone())),
                events,
                config,
            }),
        };
        (broker, rx)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Run `f` inside the critical section, then flush its outbox.
    async fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState, &mut Outbox) -> T) -> T {
        let mut out = Outbox::new();
        let result = {
            let mut state = self.inner.state.lock().await;
            f(&mut state, &mut out)
        };
        flush(out).await;
        result
    }

    // ---------------------------------------------------------------
    // Runners
    // ---------------------------------------------------------------

    /// Register a runner. Deferred tasks it can take are offered right away,
    /// so drain the handle's receiver promptly.
    pub async fn register(&self, info: RunnerInfo) -> Result<RunnerHandle, BrokerError> {
        let (tx, rx) = mpsc::channel(RUNNER_CHANNEL_CAPACITY);
        let runner_id = info.runner_id.clone();
        self.with_state(|state, out| state.register(info, tx, out))
            .await?;
        Ok(RunnerHandle { runner_id, rx })
    }

    pub async fn heartbeat(&self, runner_id: &RunnerId) {
        self.inner.state.lock().await.heartbeat(runner_id);
    }

    /// Remove a runner, failing whatever it was executing. Returns the ids of
    /// the failed tasks; unknown runners are a no-op.
    pub async fn deregister(&self, runner_id: &RunnerId) -> Vec<TaskId> {
        let failed = self
            .with_state(|state, out| state.deregister(runner_id, out))
            .await;
        match failed {
            Some(failed) => failed,
            None => {
                debug!(runner_id = %runner_id, "Deregister for unknown runner ignored");
                Vec::new()
            }
        }
    }

    // ---------------------------------------------------------------
    // Clients
    // ---------------------------------------------------------------

    /// Submit a task. `deadline` limits execution time once a runner accepts;
    /// `None` applies the configured default.
    pub async fn submit(
        &self,
        client: &str,
        payload: TaskPayload,
        deadline: Option<Duration>,
    ) -> Result<TaskId, BrokerError> {
        self.with_state(|state, out| state.submit(client, payload, deadline, out))
            .await
    }

    /// Wait for a task's outcome.
    pub async fn await_result(&self, task_id: &TaskId) -> Result<TaskOutcome, BrokerError> {
        let subscription = self.inner.state.lock().await.subscribe(task_id)?;
        match subscription {
            Subscription::Ready(outcome) => Ok(outcome),
            Subscription::Waiting(rx) => rx.await.map_err(|_| BrokerError::Closed),
        }
    }

    pub async fn cancel(&self, task_id: &TaskId, reason: &str) -> Result<(), BrokerError> {
        self.with_state(|state, out| state.cancel(task_id, reason, out))
            .await
    }

    /// Give up on a task that is still waiting for runner capacity.
    pub async fn withdraw(&self, task_id: &TaskId) -> Result<(), BrokerError> {
        self.inner.state.lock().await.withdraw(task_id)
    }

    // ---------------------------------------------------------------
    // Runner reports
    // ---------------------------------------------------------------

    pub async fn accept(&self, runner_id: &RunnerId, task_id: &TaskId) -> Result<(), BrokerError> {
        self.inner.state.lock().await.accept(runner_id, task_id)
    }

    pub async fn reject(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        rejection: TaskRejectError,
    ) -> Result<(), BrokerError> {
        self.with_state(|state, out| state.reject(runner_id, task_id, rejection, out))
            .await
    }

    pub async fn report_progress(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
    ) -> Result<(), BrokerError> {
        self.inner
            .state
            .lock()
            .await
            .report_progress(runner_id, task_id)
    }

    pub async fn complete(
        &self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        outcome: TaskOutcome,
    ) -> Result<(), BrokerError> {
        self.with_state(|state, out| state.complete(runner_id, task_id, outcome, out))
            .await
    }

    pub async fn cancel_ack(&self, runner_id: &RunnerId, task_id: &TaskId) -> Result<(), BrokerError> {
        self.with_state(|state, out| state.cancel_ack(runner_id, task_id, out))
            .await
    }

    // ---------------------------------------------------------------
    // Liveness
    // ---------------------------------------------------------------

    /// Run one heartbeat check and emit the resulting events.
    pub async fn check_heartbeats(&self) {
        let events = self
            .inner
            .state
            .lock()
            .await
            .check_heartbeats(Instant::now());
        self.emit(events).await;
    }

    /// Run one sweep (offer expiry, cancel grace, deadlines, deferred queue,
    /// retention) and emit the resulting events.
    pub async fn sweep(&self) {
        let events = self
            .with_state(|state, out| state.sweep(Instant::now(), out))
            .await;
        self.emit(events).await;
    }

    async fn emit(&self, events: Vec<LifecycleEvent>) {
        for event in events {
            if self.inner.events.send(event).await.is_err() {
                warn!("Lifecycle channel closed, dropping event");
                return;
            }
        }
    }

    /// React to a lifecycle event.
    ///
    /// A failed heartbeat check deregisters the runner at once, unless the
    /// runner has re-registered since the check. A task that
    /// timed out is failed, and its runner gets one heartbeat interval to
    /// prove it is still alive.
    pub async fn handle_event(&self, event: LifecycleEvent) {
        info!(event = %event, "Lifecycle event");
        match event {
            LifecycleEvent::FailedHeartbeatCheck {
                runner_id,
                registration,
                ..
            } => {
                let failed = self
                    .with_state(|state, out| state.fail_heartbeat(&runner_id, registration, out))
                    .await
                    .unwrap_or_default();
                if !failed.is_empty() {
                    warn!(
                        runner_id = %runner_id,
                        tasks = ?failed,
                        "Tasks lost with runner"
                    );
                }
            }
            LifecycleEvent::TimedOutDuringTask { task_id, runner_id } => {
                self.with_state(|state, out| state.timed_out(&task_id, &runner_id, out))
                    .await;
            }
        }
    }

    // ---------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------

    pub async fn runners(&self) -> Vec<RunnerSnapshot> {
        self.inner.state.lock().await.runners()
    }

    pub async fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.inner.state.lock().await.task(task_id)
    }

    pub async fn deferred_queue(&self) -> Vec<TaskId> {
        self.inner.state.lock().await.deferred_queue()
    }

    pub async fn stats(&self) -> BrokerStats {
        self.inner.state.lock().await.stats()
    }
}

async fn flush(out: Outbox) {
    for (tx, message) in out.into_messages() {
        if tx.send(message).await.is_err() {
            // The connection is gone; its deregistration reclaims the task.
            debug!("Runner channel closed, message dropped");
        }
    }
}
