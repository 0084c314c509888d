//! Broker state: runner registry, task table and deferred queue.
//!
//! Everything here is synchronous. [`Broker`](crate::Broker) wraps the state
//! in one mutex and calls exactly one method per operation, so every method
//! is a single critical section. Messages for runners are not sent from
//! here; they are collected into an [`Outbox`] and sent after the lock is
//! released, once the state transition they announce is committed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskbroker_core::{
    terminal_status, BrokerMessage, RunnerId, RunnerInfo, Task, TaskError, TaskId, TaskOutcome,
    TaskPayload, TaskRejectError, TaskStatus,
};

use crate::config::Config;
use crate::error::BrokerError;
use crate::events::{HeartbeatFailure, LifecycleEvent};
use crate::registry::RunnerRegistry;

/// Messages waiting to be sent once the lock is released.
#[derive(Default)]
pub struct Outbox {
    messages: Vec<(mpsc::Sender<BrokerMessage>, BrokerMessage)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, tx: &mpsc::Sender<BrokerMessage>, message: BrokerMessage) {
        self.messages.push((tx.clone(), message));
    }

    pub fn into_messages(self) -> Vec<(mpsc::Sender<BrokerMessage>, BrokerMessage)> {
        self.messages
    }
}

/// A cancel sent to a runner and not yet acknowledged.
struct PendingCancel {
    reason: String,
    grace_until: Instant,
}

/// Broker-side bookkeeping for one task.
struct TaskEntry {
    task: Task,
    timeout: Option<Duration>,
    offered_at: Option<Instant>,
    deadline_at: Option<Instant>,
    /// Runners that rejected the task, passed over until the given instant.
    rejected_by: HashMap<RunnerId, Instant>,
    pending_cancel: Option<PendingCancel>,
    timeout_reported: bool,
    finished_at: Option<Instant>,
    waiters: Vec<oneshot::Sender<TaskOutcome>>,
}

impl TaskEntry {
    fn new(task: Task, timeout: Option<Duration>) -> Self {
        Self {
            task,
            timeout,
            offered_at: None,
            deadline_at: None,
            rejected_by: HashMap::new(),
            pending_cancel: None,
            timeout_reported: false,
            finished_at: None,
            waiters: Vec::new(),
        }
    }

    fn is_on(&self, runner_id: &RunnerId) -> bool {
        self.task.runner_id.as_ref() == Some(runner_id)
    }

    /// Runners still within their rejection backoff.
    fn excluded(&self, now: Instant) -> HashSet<RunnerId> {
        self.rejected_by
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(runner_id, _)| runner_id.clone())
            .collect()
    }
}

/// Result of asking for a task's outcome.
pub enum Subscription {
    /// The task is already terminal.
    Ready(TaskOutcome),
    /// Resolves when the task becomes terminal.
    Waiting(oneshot::Receiver<TaskOutcome>),
}

/// Runner as shown on the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    pub runner_id: RunnerId,
    pub name: String,
    pub task_types: Vec<String>,
    pub max_concurrency: u32,
    pub in_flight: u32,
    pub tasks: Vec<TaskId>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub suspect: bool,
}

/// Aggregate counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerStats {
    pub runners: usize,
    pub slots_total: u64,
    pub slots_used: u64,
    pub deferred: usize,
    pub tasks_by_status: BTreeMap<TaskStatus, usize>,
}

/// All mutable broker state.
pub struct BrokerState {
    config: Config,
    runners: RunnerRegistry,
    tasks: HashMap<TaskId, TaskEntry>,
    deferred: VecDeque<TaskId>,
}

impl BrokerState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            runners: RunnerRegistry::new(),
            tasks: HashMap::new(),
            deferred: VecDeque::new(),
        }
    }

    // ---------------------------------------------------------------
    // Runner lifecycle
    // ---------------------------------------------------------------

    /// Add a runner and hand it any deferred work it can take.
    pub fn register(
        &mut self,
        mut info: RunnerInfo,
        tx: mpsc::Sender<BrokerMessage>,
        out: &mut Outbox,
    ) -> Result<(), BrokerError> {
        if self.runners.contains(&info.runner_id) {
            return Err(BrokerError::DuplicateRunner(info.runner_id));
        }
        if info.max_concurrency == 0 {
            return Err(BrokerError::InvalidInput(
                "max_concurrency must be positive".to_string(),
            ));
        }
        if info.max_concurrency > self.config.max_concurrency {
            warn!(
                runner_id = %info.runner_id,
                declared = info.max_concurrency,
                limit = self.config.max_concurrency,
                "Clamping runner concurrency"
            );
            info.max_concurrency = self.config.max_concurrency;
        }

        info!(
            runner_id = %info.runner_id,
            name = %info.name,
            task_types = ?info.task_types,
            max_concurrency = info.max_concurrency,
            "Runner registered"
        );
        self.runners.insert(info, tx);
        self.dispatch_deferred(out);
        Ok(())
    }

    /// Record a heartbeat. Unknown runners are logged and ignored.
    pub fn heartbeat(&mut self, runner_id: &RunnerId) -> bool {
        match self.runners.get_mut(runner_id) {
            Some(runner) => {
                runner.last_heartbeat = Instant::now();
                runner.last_heartbeat_at = Utc::now();
                if runner.suspect_since.take().is_some() {
                    info!(runner_id = %runner_id, "Suspect runner proved liveness");
                }
                debug!(runner_id = %runner_id, in_flight = runner.in_flight(), "Heartbeat received");
                true
            }
            None => {
                warn!(runner_id = %runner_id, "Heartbeat from unknown runner");
                false
            }
        }
    }

    /// Remove a runner.
    ///
    /// Tasks it was executing fail with `RunnerLost` (or finish as cancelled
    /// when a cancel was pending). Tasks merely offered to it never started,
    /// so they go back through placement. Returns the failed task ids, or
    /// `None` if the runner was not registered.
    pub fn deregister(&mut self, runner_id: &RunnerId, out: &mut Outbox) -> Option<Vec<TaskId>> {
        let runner = self.runners.remove(runner_id)?;

        let mut failed = Vec::new();
        let mut replace = Vec::new();

        for task_id in runner.tasks {
            let Some(entry) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            match entry.task.status {
                TaskStatus::Offered => {
                    entry.task.runner_id = None;
                    entry.offered_at = None;
                    replace.push(task_id);
                }
                TaskStatus::Accepted | TaskStatus::Running => {
                    let outcome = match &entry.pending_cancel {
                        Some(cancel) => Err(TaskError::Cancelled {
                            reason: cancel.reason.clone(),
                        }),
                        None => Err(TaskError::RunnerLost {
                            runner_id: runner_id.clone(),
                        }),
                    };
                    if self.finish(&task_id, outcome).is_ok() {
                        failed.push(task_id);
                    }
                }
                _ => {}
            }
        }

        info!(
            runner_id = %runner_id,
            failed_tasks = failed.len(),
            reoffered_tasks = replace.len(),
            "Runner deregistered"
        );

        for task_id in replace {
            self.place(&task_id, out);
        }
        self.dispatch_deferred(out);

        Some(failed)
    }

    /// Deregister a runner that failed its heartbeat check, provided it is
    /// still the same registration. Returns `None` for unknown runners and
    /// for runners that have re-registered since the check.
    pub fn fail_heartbeat(
        &mut self,
        runner_id: &RunnerId,
        registration: u64,
        out: &mut Outbox,
    ) -> Option<Vec<TaskId>> {
        let current = self.runners.get(runner_id)?.seq;
        if current != registration {
            debug!(
                runner_id = %runner_id,
                registration,
                current,
                "Heartbeat failure for an earlier registration ignored"
            );
            return None;
        }
        self.deregister(runner_id, out)
    }

    // ---------------------------------------------------------------
    // Client operations
    // ---------------------------------------------------------------

    /// Create a task and offer it or defer it.
    pub fn submit(
        &mut self,
        client: &str,
        payload: TaskPayload,
        timeout: Option<Duration>,
        out: &mut Outbox,
    ) -> Result<TaskId, BrokerError> {
        payload.validate()?;

        let timeout = timeout.or_else(|| self.config.task_timeout());
        let task = Task::new(client, payload);
        let task_id = task.id.clone();

        info!(
            task_id = %task_id,
            client = %client,
            task_type = %task.payload.task_type,
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "Task submitted"
        );
        self.tasks.insert(task_id.clone(), TaskEntry::new(task, timeout));

        // Older deferred tasks get first pick of any free slot.
        self.dispatch_deferred(out);
        self.place(&task_id, out);

        Ok(task_id)
    }

    /// Outcome now, or a receiver for it.
    pub fn subscribe(&mut self, task_id: &TaskId) -> Result<Subscription, BrokerError> {
        let entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::TaskNotFound(task_id.clone()))?;

        if let Some(outcome) = &entry.task.outcome {
            return Ok(Subscription::Ready(outcome.clone()));
        }
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(tx);
        Ok(Subscription::Waiting(rx))
    }

    /// Cancel a task.
    ///
    /// Tasks that have not been accepted are cancelled on the spot. Tasks
    /// executing on a runner get a cancel request and stay in place until
    /// the runner acknowledges or the grace period runs out.
    pub fn cancel(
        &mut self,
        task_id: &TaskId,
        reason: &str,
        out: &mut Outbox,
    ) -> Result<(), BrokerError> {
        let entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::TaskNotFound(task_id.clone()))?;

        let outcome = Err(TaskError::Cancelled {
            reason: reason.to_string(),
        });

        match entry.task.status {
            status if status.is_terminal() => Err(BrokerError::InvalidStateTransition {
                task_id: task_id.clone(),
                from: status,
                to: TaskStatus::Cancelled,
            }),
            TaskStatus::Pending | TaskStatus::Deferred => {
                self.deferred.retain(|id| id != task_id);
                self.finish(task_id, outcome)?;
                info!(task_id = %task_id, reason = %reason, "Task cancelled before dispatch");
                Ok(())
            }
            TaskStatus::Offered => {
                self.release_slot(task_id);
                self.finish(task_id, outcome)?;
                info!(task_id = %task_id, reason = %reason, "Offered task cancelled");
                self.dispatch_deferred(out);
                Ok(())
            }
            _ => {
                if entry.pending_cancel.is_some() {
                    return Ok(());
                }
                let Some(runner) = entry
                    .task
                    .runner_id
                    .as_ref()
                    .and_then(|id| self.runners.get(id))
                else {
                    // Unreachable while the slot invariant holds; finish anyway.
                    return self.finish(task_id, outcome);
                };

                entry.pending_cancel = Some(PendingCancel {
                    reason: reason.to_string(),
                    grace_until: Instant::now() + self.config.cancel_grace(),
                });
                out.push(
                    &runner.tx,
                    BrokerMessage::Cancel {
                        task_id: task_id.clone(),
                        reason: reason.to_string(),
                    },
                );
                info!(
                    task_id = %task_id,
                    runner_id = %runner.info.runner_id,
                    reason = %reason,
                    "Cancel requested from runner"
                );
                Ok(())
            }
        }
    }

    /// Caller gives up on a task still waiting for capacity.
    pub fn withdraw(&mut self, task_id: &TaskId) -> Result<(), BrokerError> {
        let status = self
            .tasks
            .get(task_id)
            .map(|e| e.task.status)
            .ok_or_else(|| BrokerError::TaskNotFound(task_id.clone()))?;

        if status != TaskStatus::Deferred {
            return Err(BrokerError::InvalidStateTransition {
                task_id: task_id.clone(),
                from: status,
                to: TaskStatus::Cancelled,
            });
        }

        self.deferred.retain(|id| id != task_id);
        self.finish(task_id, Err(TaskError::Deferred))?;
        info!(task_id = %task_id, "Deferred task withdrawn by caller");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Runner operations
    // ---------------------------------------------------------------

    /// Offered -> Accepted. Starts the execution deadline.
    pub fn accept(&mut self, runner_id: &RunnerId, task_id: &TaskId) -> Result<(), BrokerError> {
        let entry = self.offered_to(runner_id, task_id, TaskStatus::Accepted)?;

        entry.task.transition(TaskStatus::Accepted)?;
        entry.offered_at = None;
        if let Some(timeout) = entry.timeout {
            entry.deadline_at = Some(Instant::now() + timeout);
            entry.task.deadline = chrono::Duration::from_std(timeout)
                .ok()
                .map(|d| Utc::now() + d);
        }

        info!(task_id = %task_id, runner_id = %runner_id, "Task accepted");
        Ok(())
    }

    /// The runner declined an offer: try another runner, else defer.
    pub fn reject(
        &mut self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        rejection: TaskRejectError,
        out: &mut Outbox,
    ) -> Result<(), BrokerError> {
        self.offered_to(runner_id, task_id, TaskStatus::Deferred)?;

        self.release_slot(task_id);
        let backoff_until = Instant::now() + self.config.reject_backoff();
        if let Some(entry) = self.tasks.get_mut(task_id) {
            entry.rejected_by.insert(runner_id.clone(), backoff_until);
            entry.task.runner_id = None;
            entry.offered_at = None;
        }
        warn!(
            task_id = %task_id,
            runner_id = %runner_id,
            reason = %rejection.reason,
            "Runner rejected task"
        );

        self.place(task_id, out);
        self.dispatch_deferred(out);
        Ok(())
    }

    /// Accepted -> Running. Repeated reports are no-ops.
    pub fn report_progress(
        &mut self,
        runner_id: &RunnerId,
        task_id: &TaskId,
    ) -> Result<(), BrokerError> {
        let entry = self.executing_on(runner_id, task_id, TaskStatus::Running)?;
        if entry.task.status == TaskStatus::Accepted {
            entry.task.transition(TaskStatus::Running)?;
            debug!(task_id = %task_id, runner_id = %runner_id, "Task running");
        }
        Ok(())
    }

    /// The runner finished a task, successfully or not.
    pub fn complete(
        &mut self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        outcome: TaskOutcome,
        out: &mut Outbox,
    ) -> Result<(), BrokerError> {
        let entry = self.executing_on(runner_id, task_id, terminal_status(&outcome))?;

        let outcome = match &entry.pending_cancel {
            Some(cancel) => Err(TaskError::Cancelled {
                reason: cancel.reason.clone(),
            }),
            None => user_outcome(outcome),
        };
        if entry.task.status == TaskStatus::Accepted {
            entry.task.transition(TaskStatus::Running)?;
        }

        self.release_slot(task_id);
        self.finish(task_id, outcome)?;
        self.dispatch_deferred(out);
        Ok(())
    }

    /// The runner confirmed it stopped a task.
    pub fn cancel_ack(
        &mut self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        out: &mut Outbox,
    ) -> Result<(), BrokerError> {
        let Some(entry) = self.tasks.get(task_id) else {
            debug!(task_id = %task_id, "Cancel ack for unknown task");
            return Ok(());
        };
        if entry.task.is_terminal() {
            // Late ack after a timeout or grace expiry.
            return Ok(());
        }

        let entry = self.executing_on(runner_id, task_id, TaskStatus::Cancelled)?;
        let reason = entry
            .pending_cancel
            .as_ref()
            .map(|c| c.reason.clone())
            .unwrap_or_else(|| "cancelled by runner".to_string());

        self.release_slot(task_id);
        self.finish(task_id, Err(TaskError::Cancelled { reason }))?;
        info!(task_id = %task_id, runner_id = %runner_id, "Runner acknowledged cancel");
        self.dispatch_deferred(out);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Liveness and timers
    // ---------------------------------------------------------------

    /// Find runners that failed their heartbeat check. Each runner is
    /// reported at most once.
    pub fn check_heartbeats(&mut self, now: Instant) -> Vec<LifecycleEvent> {
        let timeout = self.config.heartbeat_timeout();
        let interval = self.config.heartbeat_interval();
        let mut events = Vec::new();

        for runner in self.runners.iter_mut() {
            if runner.failure_reported {
                continue;
            }

            let silent_for = now.saturating_duration_since(runner.last_heartbeat);
            let cause = if silent_for > timeout {
                Some(HeartbeatFailure::Missed { silent_for })
            } else {
                runner
                    .suspect_since
                    .filter(|since| now.saturating_duration_since(*since) >= interval)
                    .map(|_| HeartbeatFailure::Unconfirmed)
            };

            if let Some(cause) = cause {
                runner.failure_reported = true;
                warn!(
                    runner_id = %runner.info.runner_id,
                    cause = ?cause,
                    "Runner failed heartbeat check"
                );
                events.push(LifecycleEvent::FailedHeartbeatCheck {
                    runner_id: runner.info.runner_id.clone(),
                    registration: runner.seq,
                    cause,
                });
            }
        }

        events
    }

    /// A task ran past its deadline: fail it and put the runner on notice.
    pub fn timed_out(
        &mut self,
        task_id: &TaskId,
        runner_id: &RunnerId,
        out: &mut Outbox,
    ) -> bool {
        let Some(entry) = self.tasks.get(task_id) else {
            return false;
        };
        if !entry.task.status.is_executing() || !entry.is_on(runner_id) {
            return false;
        }
        let timeout_ms = entry.timeout.map(|t| t.as_millis() as u64).unwrap_or(0);

        self.release_slot(task_id);
        if self.finish(task_id, Err(TaskError::Timeout { timeout_ms })).is_err() {
            return false;
        }
        warn!(task_id = %task_id, runner_id = %runner_id, timeout_ms, "Task timed out");

        if let Some(runner) = self.runners.get_mut(runner_id) {
            runner.suspect_since.get_or_insert_with(Instant::now);
            out.push(
                &runner.tx,
                BrokerMessage::Cancel {
                    task_id: task_id.clone(),
                    reason: "task timed out".to_string(),
                },
            );
        }
        self.dispatch_deferred(out);
        true
    }

    /// Periodic housekeeping: expire offers and cancel grace periods, detect
    /// deadlines, re-evaluate the deferred queue and purge old tasks.
    ///
    /// Returns the timeout events to emit; the tasks are failed when those
    /// events are handled.
    pub fn sweep(&mut self, now: Instant, out: &mut Outbox) -> Vec<LifecycleEvent> {
        let offer_timeout = self.config.offer_timeout();
        let mut events = Vec::new();
        let mut expired_offers = Vec::new();
        let mut expired_cancels = Vec::new();

        for (task_id, entry) in self.tasks.iter_mut() {
            let Some(runner_id) = entry.task.runner_id.clone() else {
                continue;
            };
            match entry.task.status {
                TaskStatus::Offered => {
                    if entry.offered_at.is_some_and(|at| at + offer_timeout <= now) {
                        expired_offers.push((task_id.clone(), runner_id));
                    }
                }
                TaskStatus::Accepted | TaskStatus::Running => {
                    if entry
                        .pending_cancel
                        .as_ref()
                        .is_some_and(|c| c.grace_until <= now)
                    {
                        expired_cancels.push((task_id.clone(), runner_id));
                    } else if !entry.timeout_reported
                        && entry.deadline_at.is_some_and(|d| d <= now)
                    {
                        entry.timeout_reported = true;
                        events.push(LifecycleEvent::TimedOutDuringTask {
                            task_id: task_id.clone(),
                            runner_id,
                        });
                    }
                }
                _ => {}
            }
        }

        for (task_id, runner_id) in expired_offers {
            let _ = self.reject(
                &runner_id,
                &task_id,
                TaskRejectError::new("offer expired"),
                out,
            );
        }
        for (task_id, runner_id) in expired_cancels {
            self.cancel_grace_expired(&task_id, &runner_id);
        }

        self.dispatch_deferred(out);
        self.purge(now);
        events
    }

    fn cancel_grace_expired(&mut self, task_id: &TaskId, runner_id: &RunnerId) {
        let reason = self
            .tasks
            .get_mut(task_id)
            .and_then(|e| e.pending_cancel.take())
            .map(|c| c.reason)
            .unwrap_or_default();

        self.release_slot(task_id);
        if self
            .finish(task_id, Err(TaskError::Cancelled { reason }))
            .is_err()
        {
            return;
        }
        warn!(
            task_id = %task_id,
            runner_id = %runner_id,
            "Runner ignored cancel, marking suspect"
        );
        if let Some(runner) = self.runners.get_mut(runner_id) {
            runner.suspect_since.get_or_insert_with(Instant::now);
        }
    }

    fn purge(&mut self, now: Instant) {
        let retention = self.config.task_retention();
        let before = self.tasks.len();
        self.tasks.retain(|_, entry| {
            !entry
                .finished_at
                .is_some_and(|at| at + retention <= now)
        });
        let purged = before - self.tasks.len();
        if purged > 0 {
            debug!(purged, "Purged finished tasks");
        }
    }

    // ---------------------------------------------------------------
    // Placement
    // ---------------------------------------------------------------

    /// Offer the task to the best runner, or queue it.
    fn place(&mut self, task_id: &TaskId, out: &mut Outbox) {
        let Some(entry) = self.tasks.get(task_id) else {
            return;
        };
        let excluded = entry.excluded(Instant::now());
        match self
            .runners
            .select(&entry.task.payload.task_type, &excluded)
        {
            Some(runner_id) => self.offer_to(task_id, &runner_id, out),
            None => self.defer(task_id),
        }
    }

    fn defer(&mut self, task_id: &TaskId) {
        let Some(entry) = self.tasks.get_mut(task_id) else {
            return;
        };
        if entry.task.transition(TaskStatus::Deferred).is_err() {
            return;
        }
        entry.task.runner_id = None;
        entry.offered_at = None;
        self.deferred.push_back(task_id.clone());
        info!(
            task_id = %task_id,
            queue_len = self.deferred.len(),
            "No runner available, task deferred"
        );
    }

    fn offer_to(&mut self, task_id: &TaskId, runner_id: &RunnerId, out: &mut Outbox) {
        let (Some(entry), Some(runner)) =
            (self.tasks.get_mut(task_id), self.runners.get_mut(runner_id))
        else {
            return;
        };
        if !runner.has_capacity() {
            return;
        }
        if entry.task.status != TaskStatus::Offered
            && entry.task.transition(TaskStatus::Offered).is_err()
        {
            return;
        }

        runner.tasks.insert(task_id.clone());
        entry.task.runner_id = Some(runner_id.clone());
        entry.offered_at = Some(Instant::now());

        info!(
            task_id = %task_id,
            runner_id = %runner_id,
            in_flight = runner.in_flight(),
            max_concurrency = runner.info.max_concurrency,
            "Offering task to runner"
        );
        out.push(
            &runner.tx,
            BrokerMessage::Offer {
                task_id: task_id.clone(),
                payload: entry.task.payload.clone(),
                timeout_ms: entry.timeout.map(|t| t.as_millis() as u64),
            },
        );
    }

    /// Offer deferred tasks, oldest first, while capacity lasts.
    ///
    /// A task only passes an older one when the older one has no eligible
    /// runner at all (wrong task type, or every free runner rejected it
    /// within the backoff).
    fn dispatch_deferred(&mut self, out: &mut Outbox) {
        if self.deferred.is_empty() {
            return;
        }
        let now = Instant::now();

        let mut waiting = VecDeque::with_capacity(self.deferred.len());
        while let Some(task_id) = self.deferred.pop_front() {
            if !self.runners.any_capacity() {
                waiting.push_back(task_id);
                waiting.extend(self.deferred.drain(..));
                break;
            }
            let Some(entry) = self.tasks.get(&task_id) else {
                continue;
            };
            if entry.task.status != TaskStatus::Deferred {
                continue;
            }
            let excluded = entry.excluded(now);
            match self
                .runners
                .select(&entry.task.payload.task_type, &excluded)
            {
                Some(runner_id) => self.offer_to(&task_id, &runner_id, out),
                None => waiting.push_back(task_id),
            }
        }
        self.deferred = waiting;
    }

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    /// Look up a task that must be Offered to `runner_id`.
    fn offered_to(
        &mut self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        to: TaskStatus,
    ) -> Result<&mut TaskEntry, BrokerError> {
        let entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::TaskNotFound(task_id.clone()))?;
        if entry.task.status != TaskStatus::Offered {
            return Err(BrokerError::InvalidStateTransition {
                task_id: task_id.clone(),
                from: entry.task.status,
                to,
            });
        }
        if !entry.is_on(runner_id) {
            return Err(BrokerError::NotAssigned {
                task_id: task_id.clone(),
                runner_id: runner_id.clone(),
            });
        }
        Ok(entry)
    }

    /// Look up a task that must be Accepted or Running on `runner_id`.
    fn executing_on(
        &mut self,
        runner_id: &RunnerId,
        task_id: &TaskId,
        to: TaskStatus,
    ) -> Result<&mut TaskEntry, BrokerError> {
        let entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::TaskNotFound(task_id.clone()))?;
        if !entry.task.status.is_executing() {
            return Err(BrokerError::InvalidStateTransition {
                task_id: task_id.clone(),
                from: entry.task.status,
                to,
            });
        }
        if !entry.is_on(runner_id) {
            return Err(BrokerError::NotAssigned {
                task_id: task_id.clone(),
                runner_id: runner_id.clone(),
            });
        }
        Ok(entry)
    }

    /// Free the runner slot a task holds. The task keeps its runner id as history.
    ///
    /// A slot freed by finished work lifts that runner's rejections of
    /// deferred tasks, since capacity was the likely reason for them.
    fn release_slot(&mut self, task_id: &TaskId) {
        let Some(entry) = self.tasks.get(task_id) else {
            return;
        };
        let was_executing = entry.task.status.is_executing();
        let Some(runner_id) = entry.task.runner_id.clone() else {
            return;
        };
        if let Some(runner) = self.runners.get_mut(&runner_id) {
            runner.tasks.remove(task_id);
        }
        if was_executing {
            for deferred in &self.deferred {
                if let Some(entry) = self.tasks.get_mut(deferred) {
                    entry.rejected_by.remove(&runner_id);
                }
            }
        }
    }

    /// Enter a terminal state and wake everyone waiting on the task.
    fn finish(&mut self, task_id: &TaskId, outcome: TaskOutcome) -> Result<(), BrokerError> {
        let entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::TaskNotFound(task_id.clone()))?;

        let to = terminal_status(&outcome);
        if !entry.task.status.can_transition_to(to) {
            return Err(BrokerError::InvalidStateTransition {
                task_id: task_id.clone(),
                from: entry.task.status,
                to,
            });
        }

        entry.task.finish(outcome.clone())?;
        entry.finished_at = Some(Instant::now());
        entry.pending_cancel = None;
        entry.deadline_at = None;
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }

        info!(task_id = %task_id, status = %to, "Task finished");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------

    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.get(task_id).map(|e| e.task.clone())
    }

    pub fn deferred_queue(&self) -> Vec<TaskId> {
        self.deferred.iter().cloned().collect()
    }

    pub fn runners(&self) -> Vec<RunnerSnapshot> {
        let mut runners: Vec<_> = self
            .runners
            .iter()
            .map(|r| {
                (
                    r.seq,
                    RunnerSnapshot {
                        runner_id: r.info.runner_id.clone(),
                        name: r.info.name.clone(),
                        task_types: r.info.task_types.clone(),
                        max_concurrency: r.info.max_concurrency,
                        in_flight: r.in_flight(),
                        tasks: r.tasks.iter().cloned().collect(),
                        registered_at: r.registered_at,
                        last_heartbeat_at: r.last_heartbeat_at,
                        suspect: r.suspect_since.is_some(),
                    },
                )
            })
            .collect();
        runners.sort_by_key(|(seq, _)| *seq);
        runners.into_iter().map(|(_, r)| r).collect()
    }

    pub fn stats(&self) -> BrokerStats {
        let mut stats = BrokerStats {
            runners: self.runners.len(),
            deferred: self.deferred.len(),
            ..BrokerStats::default()
        };
        for status in TaskStatus::ALL {
            stats.tasks_by_status.insert(status, 0);
        }
        for runner in self.runners.iter() {
            stats.slots_total += u64::from(runner.info.max_concurrency);
            stats.slots_used += u64::from(runner.in_flight());
        }
        for entry in self.tasks.values() {
            *stats.tasks_by_status.entry(entry.task.status).or_default() += 1;
        }
        stats
    }
}

/// Runners may only report user-code failures; anything else they send is
/// treated as an execution error.
fn user_outcome(outcome: TaskOutcome) -> TaskOutcome {
    match outcome {
        Err(err @ (TaskError::DisallowedModule { .. } | TaskError::Execution { .. })) => Err(err),
        Err(other) => Err(TaskError::execution(other.to_string())),
        ok => ok,
    }
}
