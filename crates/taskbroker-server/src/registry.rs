//! Runner registry.
//!
//! Holds one [`RunnerEntry`] per connected runner. Entries refer to their
//! tasks by id only; the task table lives next to the registry in
//! [`BrokerState`](crate::state::BrokerState).

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;

use taskbroker_core::{BrokerMessage, RunnerId, RunnerInfo, TaskId};

/// A registered runner.
pub struct RunnerEntry {
    /// What the runner declared at registration (concurrency already clamped).
    pub info: RunnerInfo,

    /// Registration order, used to break ties between equally loaded runners.
    pub seq: u64,

    /// Tasks holding a slot on this runner (Offered, Accepted or Running).
    pub tasks: BTreeSet<TaskId>,

    /// When the runner registered.
    pub registered_at: DateTime<Utc>,

    /// Monotonic time of the last heartbeat (registration counts as one).
    pub last_heartbeat: Instant,

    /// Wall-clock time of the last heartbeat, for display.
    pub last_heartbeat_at: DateTime<Utc>,

    /// Set when a task timed out or a cancel went unanswered on this runner.
    pub suspect_since: Option<Instant>,

    /// A heartbeat failure was already emitted for this runner.
    pub failure_reported: bool,

    /// Channel to send messages to this runner.
    pub tx: mpsc::Sender<BrokerMessage>,
}

impl RunnerEntry {
    /// Number of slots in use.
    pub fn in_flight(&self) -> u32 {
        self.tasks.len() as u32
    }

    /// Whether one more task fits.
    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.info.max_concurrency
    }

    /// Whether the runner can take a task of this type right now.
    pub fn is_eligible(&self, task_type: &str) -> bool {
        !self.failure_reported && self.has_capacity() && self.info.supports_task_type(task_type)
    }
}

/// Connected runners indexed by id.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<RunnerId, RunnerEntry>,
    next_seq: u64,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, runner_id: &RunnerId) -> bool {
        self.runners.contains_key(runner_id)
    }

    /// Insert a new runner. The caller has already checked for duplicates.
    pub fn insert(&mut self, info: RunnerInfo, tx: mpsc::Sender<BrokerMessage>) -> &RunnerEntry {
        let seq = self.next_seq;
        self.next_seq += 1;

        let runner_id = info.runner_id.clone();
        let entry = RunnerEntry {
            info,
            seq,
            tasks: BTreeSet::new(),
            registered_at: Utc::now(),
            last_heartbeat: Instant::now(),
            last_heartbeat_at: Utc::now(),
            suspect_since: None,
            failure_reported: false,
            tx,
        };
        self.runners.entry(runner_id).or_insert(entry)
    }

    pub fn remove(&mut self, runner_id: &RunnerId) -> Option<RunnerEntry> {
        self.runners.remove(runner_id)
    }

    pub fn get(&self, runner_id: &RunnerId) -> Option<&RunnerEntry> {
        self.runners.get(runner_id)
    }

    pub fn get_mut(&mut self, runner_id: &RunnerId) -> Option<&mut RunnerEntry> {
        self.runners.get_mut(runner_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunnerEntry> {
        self.runners.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RunnerEntry> {
        self.runners.values_mut()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Whether any runner has a free slot at all.
    pub fn any_capacity(&self) -> bool {
        self.runners
            .values()
            .any(|r| !r.failure_reported && r.has_capacity())
    }

    /// Pick a runner for a task: least loaded first, earliest registration on ties.
    pub fn select(&self, task_type: &str, exclude: &HashSet<RunnerId>) -> Option<RunnerId> {
        self.runners
            .values()
            .filter(|r| r.is_eligible(task_type) && !exclude.contains(&r.info.runner_id))
            .min_by_key(|r| (r.in_flight(), r.seq))
            .map(|r| r.info.runner_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(registry: &mut RunnerRegistry, id: &str, max: u32) -> mpsc::Receiver<BrokerMessage> {
        let (tx, rx) = mpsc::channel(8);
        registry.insert(RunnerInfo::new(RunnerId::new(id), max), tx);
        rx
    }

    #[tokio::test]
    async fn test_select_least_loaded_then_earliest() {
        let mut registry = RunnerRegistry::new();
        let _a = add(&mut registry, "a", 2);
        let _b = add(&mut registry, "b", 2);
        let none = HashSet::new();

        // Tie on load: earliest registration wins.
        assert_eq!(registry.select("javascript", &none), Some(RunnerId::new("a")));

        registry
            .get_mut(&RunnerId::new("a"))
            .unwrap()
            .tasks
            .insert(TaskId::new("t1"));
        assert_eq!(registry.select("javascript", &none), Some(RunnerId::new("b")));
    }

    #[tokio::test]
    async fn test_full_or_excluded_runners_are_skipped() {
        let mut registry = RunnerRegistry::new();
        let _a = add(&mut registry, "a", 1);
        let _b = add(&mut registry, "b", 1);

        registry
            .get_mut(&RunnerId::new("a"))
            .unwrap()
            .tasks
            .insert(TaskId::new("t1"));

        let mut exclude = HashSet::new();
        exclude.insert(RunnerId::new("b"));
        assert_eq!(registry.select("javascript", &exclude), None);
        assert_eq!(registry.select("python", &HashSet::new()), None);
        assert!(registry.any_capacity());
    }
}
