// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Scheduler (C4): dependency-gated admission, pull-based builder
//! selection, and the global parallelism cap.
//!
//! All scheduler operations run under a single mutex covering the
//! queue, the task table, the dependency graph, and the completed set.
//! The lock is only ever held for O(log n) heap work or an O(n) sweep
//! of `waiting_deps` tasks -- no suspension points occur while it is
//! held (§5).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{CapacityError, CoreError, CoreResult};
use crate::job::{package_key, BuilderId, JobId, JobState, PackageKey};
use crate::queue::{clamp_nice, PriorityQueue, Task};
use crate::registry::BuilderRegistry;

/// Internal scheduler state guarded by a single mutex.
struct Inner {
    queue: PriorityQueue,
    tasks: HashMap<JobId, Task>,
    states: HashMap<JobId, JobState>,
    deps_graph: HashMap<PackageKey, Vec<PackageKey>>,
    completed: HashSet<PackageKey>,
}

/// The dependency-aware priority scheduler (C4).
pub struct Scheduler {
    inner: Mutex<Inner>,
    registry: Arc<BuilderRegistry>,
    in_flight: AtomicUsize,
    max_parallel: usize,
}

/// Outcome of a successful `GetNextTask` call.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// The task handed to the builder.
    pub task: Task,
}

impl Scheduler {
    /// Construct a scheduler sharing a builder registry with the
    /// coordinator's HTTP layer.
    #[must_use]
    pub fn new(registry: Arc<BuilderRegistry>, max_parallel: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: PriorityQueue::new(),
                tasks: HashMap::new(),
                states: HashMap::new(),
                deps_graph: HashMap::new(),
                completed: HashSet::new(),
            }),
            registry,
            in_flight: AtomicUsize::new(0),
            max_parallel,
        }
    }

    /// Overwrite the dependency list for `package` (`AddDependency`).
    pub fn add_dependency(&self, package: PackageKey, deps: Vec<PackageKey>) {
        let mut inner = self.inner.lock();
        inner.deps_graph.insert(package, deps);
    }

    /// Admit a task. Nice is clamped to `[-20, 19]`. If every dependency
    /// (explicit, or looked up from a prior `AddDependency` call when
    /// `deps` is empty and the package has a registered graph entry) is
    /// already in the completed set, the task becomes `Ready` and is
    /// pushed; otherwise it becomes `WaitingDeps` and is held.
    ///
    /// Rejects with `CoreError::DuplicateJobId` if `job_id` has already
    /// been submitted.
    pub fn submit_task(
        &self,
        job_id: JobId,
        package: &str,
        version: &str,
        priority: i32,
        nice: i32,
        deps: Vec<PackageKey>,
    ) -> CoreResult<JobState> {
        let mut inner = self.inner.lock();
        if inner.tasks.contains_key(&job_id) {
            return Err(CoreError::DuplicateJobId(job_id));
        }

        let pkg_key = package_key_from(package, version);
        inner.deps_graph.entry(pkg_key.clone()).or_insert_with(|| deps.clone());

        let task = Task {
            job_id: job_id.clone(),
            package_key: pkg_key,
            version: version.to_string(),
            priority,
            nice: clamp_nice(nice),
            deps,
            submitted_at: Utc::now(),
            assignment: None,
        };

        let ready = task.deps_satisfied(&inner.completed);
        let state = if ready { JobState::Ready } else { JobState::WaitingDeps };
        inner.states.insert(job_id.clone(), state);
        if ready {
            inner.queue.push(&task);
        }
        inner.tasks.insert(job_id, task);
        Ok(state)
    }

    /// Pull one task for `builder_id`. Fails with a distinct
    /// `CapacityError` variant for each of: unknown builder, disabled
    /// builder, unhealthy builder, builder at capacity, global cap
    /// reached, or an empty queue -- in that check order, so the
    /// dispatcher can tell "try again later" apart from "never".
    pub fn get_next_task(&self, builder_id: &str) -> Result<Dispatched, CapacityError> {
        // Check eligibility and reserve the load slot in one atomic step
        // (`BuilderRegistry::try_reserve_load` holds the registry's
        // per-entry lock across both), so two concurrent calls for the
        // same builder can never both observe room under capacity and
        // both proceed.
        self.registry.try_reserve_load(builder_id)?;

        if self.in_flight.load(Ordering::SeqCst) >= self.max_parallel {
            self.registry.release_load(builder_id);
            return Err(CapacityError::GlobalCapReached(self.max_parallel));
        }

        let mut inner = self.inner.lock();
        let Some(job_id) = inner.queue.pop() else {
            drop(inner);
            self.registry.release_load(builder_id);
            return Err(CapacityError::QueueEmpty);
        };
        let task = inner.tasks.get_mut(&job_id).expect("queued task must be in task table");
        task.assignment = Some(builder_id.to_string());
        let dispatched = Dispatched { task: task.clone() };
        inner.states.insert(job_id, JobState::Building);
        drop(inner);

        self.registry.record_dispatch(builder_id);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(dispatched)
    }

    /// Mark `job_id` terminal. No-op if it is already terminal. On
    /// success, inserts the package-version key into the completed set
    /// and sweeps every `WaitingDeps` task whose dependencies are now
    /// all satisfied, promoting them to `Ready` and pushing them.
    pub fn complete_task(&self, job_id: &str, success: bool) {
        let mut inner = self.inner.lock();
        let Some(state) = inner.states.get(job_id).copied() else { return };
        if state.is_terminal() {
            return;
        }

        let Some(task) = inner.tasks.get(job_id).cloned() else { return };
        let builder_id = task.assignment.clone();

        let new_state = if success { JobState::Success } else { JobState::Failed };
        inner.states.insert(job_id.to_string(), new_state);

        if success {
            inner.completed.insert(task.package_key.clone());
            let newly_ready: Vec<JobId> = inner
                .tasks
                .iter()
                .filter(|(id, t)| {
                    inner.states.get(*id).copied() == Some(JobState::WaitingDeps)
                        && t.deps_satisfied(&inner.completed)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in newly_ready {
                inner.states.insert(id.clone(), JobState::Ready);
                let t = inner.tasks.get(&id).unwrap().clone();
                inner.queue.push(&t);
            }
        }
        drop(inner);

        if let Some(builder_id) = builder_id {
            self.registry.decr_load(&builder_id, success);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Update a builder's liveness flag only (`SetBuilderHealth`).
    pub fn set_builder_health(&self, builder_id: &str, healthy: bool) {
        self.registry.set_health(builder_id, healthy);
    }

    /// Current state of a previously submitted job, if known.
    #[must_use]
    pub fn job_state(&self, job_id: &str) -> Option<JobState> {
        self.inner.lock().states.get(job_id).copied()
    }

    /// Number of tasks currently sitting in the ready queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Current global in-flight (building) count.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run the builder-registry decay sweep for the given timeout.
    pub fn sweep_stale_builders(&self, timeout: StdDuration) -> Vec<BuilderId> {
        self.registry.sweep_stale(timeout)
    }
}

fn package_key_from(package: &str, version: &str) -> PackageKey {
    match package.split_once('/') {
        Some((category, name)) => package_key(category, name, version),
        None => format!("{package}-{version}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(capacity: u32, max_parallel: usize) -> Scheduler {
        let registry = Arc::new(BuilderRegistry::new());
        registry.register("b1".into(), "http://b1".into(), "amd64".into(), capacity);
        Scheduler::new(registry, max_parallel)
    }

    #[test]
    fn s1_single_task_no_deps() {
        let sched = scheduler(2, 10);
        let state = sched.submit_task("j1".into(), "dev-lang/python", "3.11", 5, 0, vec![]).unwrap();
        assert_eq!(state, JobState::Ready);
        assert_eq!(sched.queue_len(), 1);

        let dispatched = sched.get_next_task("b1").unwrap();
        assert_eq!(dispatched.task.job_id, "j1");
        assert_eq!(sched.job_state("j1"), Some(JobState::Building));
        assert_eq!(sched.registry.get("b1").unwrap().current_load, 1);

        sched.complete_task("j1", true);
        assert_eq!(sched.job_state("j1"), Some(JobState::Success));
        assert_eq!(sched.registry.get("b1").unwrap().current_load, 0);
    }

    #[test]
    fn s2_dependency_gating() {
        let sched = scheduler(2, 10);
        sched.submit_task("j1".into(), "sys-libs/ncurses", "6.0", 5, 0, vec![]).unwrap();
        let j2_state = sched
            .submit_task("j2".into(), "app-editors/vim", "9.0", 5, 0, vec!["sys-libs/ncurses-6.0".into()])
            .unwrap();
        assert_eq!(j2_state, JobState::WaitingDeps);
        assert_eq!(sched.queue_len(), 1);

        let d1 = sched.get_next_task("b1").unwrap();
        assert_eq!(d1.task.job_id, "j1");
        sched.complete_task("j1", true);

        assert_eq!(sched.job_state("j2"), Some(JobState::Ready));
        let d2 = sched.get_next_task("b1").unwrap();
        assert_eq!(d2.task.job_id, "j2");
    }

    #[test]
    fn s3_ordering() {
        let sched = scheduler(10, 10);
        sched.submit_task("a".into(), "cat/a", "1", 5, 10, vec![]).unwrap();
        sched.submit_task("b".into(), "cat/b", "1", 5, 0, vec![]).unwrap();
        sched.submit_task("c".into(), "cat/c", "1", 5, -10, vec![]).unwrap();
        sched.submit_task("d".into(), "cat/d", "1", 10, 0, vec![]).unwrap();

        assert_eq!(sched.get_next_task("b1").unwrap().task.job_id, "c");
        assert_eq!(sched.get_next_task("b1").unwrap().task.job_id, "d");
        assert_eq!(sched.get_next_task("b1").unwrap().task.job_id, "b");
        assert_eq!(sched.get_next_task("b1").unwrap().task.job_id, "a");
    }

    #[test]
    fn s4_capacity_refusal() {
        let sched = scheduler(1, 10);
        sched.submit_task("j1".into(), "cat/a", "1", 5, 0, vec![]).unwrap();
        sched.submit_task("j2".into(), "cat/b", "1", 5, 0, vec![]).unwrap();

        assert!(sched.get_next_task("b1").is_ok());
        let err = sched.get_next_task("b1").unwrap_err();
        assert_eq!(err, CapacityError::BuilderAtCapacity("b1".into()));
        assert_eq!(sched.queue_len(), 1);
    }

    #[test]
    fn global_parallel_cap_reached() {
        let sched = scheduler(10, 1);
        sched.submit_task("j1".into(), "cat/a", "1", 5, 0, vec![]).unwrap();
        sched.submit_task("j2".into(), "cat/b", "1", 5, 0, vec![]).unwrap();
        assert!(sched.get_next_task("b1").is_ok());
        let err = sched.get_next_task("b1").unwrap_err();
        assert_eq!(err, CapacityError::GlobalCapReached(1));
    }

    #[test]
    fn unknown_builder_is_distinguished_from_empty_queue() {
        let sched = scheduler(2, 10);
        let err = sched.get_next_task("ghost").unwrap_err();
        assert_eq!(err, CapacityError::UnknownBuilder("ghost".into()));

        let err = sched.get_next_task("b1").unwrap_err();
        assert_eq!(err, CapacityError::QueueEmpty);
    }

    #[test]
    fn duplicate_job_id_is_rejected() {
        let sched = scheduler(2, 10);
        sched.submit_task("j1".into(), "cat/a", "1", 5, 0, vec![]).unwrap();
        let err = sched.submit_task("j1".into(), "cat/a", "1", 5, 0, vec![]).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateJobId(id) if id == "j1"));
    }

    #[test]
    fn complete_task_is_idempotent_once_terminal() {
        let sched = scheduler(2, 10);
        sched.submit_task("j1".into(), "cat/a", "1", 5, 0, vec![]).unwrap();
        sched.get_next_task("b1").unwrap();
        sched.complete_task("j1", true);
        assert_eq!(sched.registry.get("b1").unwrap().current_load, 0);
        // No-op: a second terminal call must not double-decrement.
        sched.complete_task("j1", false);
        assert_eq!(sched.job_state("j1"), Some(JobState::Success));
    }
}
