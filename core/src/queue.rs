// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Priority queue (C3): a min-heap over ready tasks ordered by
//! `(nice ascending, priority descending, submit-time ascending)`.
//!
//! The queue itself is not thread-safe; it is only ever touched while
//! the scheduler holds its own mutex (see `scheduler.rs`).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{BuilderId, JobId, PackageKey};

/// Lower bound for the clamped `nice` range.
pub const NICE_MIN: i32 = -20;
/// Upper bound for the clamped `nice` range.
pub const NICE_MAX: i32 = 19;

/// Clamp a requested nice value into `[NICE_MIN, NICE_MAX]`.
#[must_use]
pub fn clamp_nice(nice: i32) -> i32 {
    nice.clamp(NICE_MIN, NICE_MAX)
}

/// The scheduler's view of a job: a unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Job id this task represents.
    pub job_id: JobId,
    /// Canonical package key, e.g. "dev-lang/python-3.11".
    pub package_key: PackageKey,
    /// Requested version (duplicated from the package key for convenience).
    pub version: String,
    /// Secondary ordering key: higher runs first within the same nice band.
    pub priority: i32,
    /// Primary ordering key, clamped to `[-20, 19]`; lower runs first.
    pub nice: i32,
    /// Package keys that must be in the completed set before this task
    /// is admitted to the ready queue.
    pub deps: Vec<PackageKey>,
    /// Submission order, used as the final tie-breaker.
    pub submitted_at: DateTime<Utc>,
    /// Builder this task is currently assigned to, once popped.
    pub assignment: Option<BuilderId>,
}

impl Task {
    /// True once every dependency is present in `completed`.
    #[must_use]
    pub fn deps_satisfied(&self, completed: &std::collections::HashSet<PackageKey>) -> bool {
        self.deps.iter().all(|d| completed.contains(d))
    }
}

/// Heap entry: orders by `(nice asc, priority desc, submitted_at asc)`.
/// `BinaryHeap` is a max-heap, so `Ord` is implemented inverted to make
/// the "most preferred" task compare greatest and thus pop first.
#[derive(Debug, Clone)]
struct HeapEntry {
    job_id: JobId,
    nice: i32,
    priority: i32,
    submitted_at: DateTime<Utc>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.nice == other.nice && self.priority == other.priority && self.submitted_at == other.submitted_at
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower nice is more preferred: reverse the natural comparison
        // so BinaryHeap (max-heap) surfaces it first.
        other.nice.cmp(&self.nice)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
    }
}

/// Min-ordered heap of ready tasks. Tasks are stored separately (by the
/// scheduler) keyed by job id; the heap only carries the ordering keys
/// plus enough identity to look the task back up, matching the "heap
/// index back-pointer" described in the data model (here expressed as
/// simple re-derivation rather than an explicit index, since
/// `BinaryHeap` does not support arbitrary removal).
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<HeapEntry>,
}

impl PriorityQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new() }
    }

    /// Push a ready task onto the queue.
    pub fn push(&mut self, task: &Task) {
        self.heap.push(HeapEntry {
            job_id: task.job_id.clone(),
            nice: task.nice,
            priority: task.priority,
            submitted_at: task.submitted_at,
        });
    }

    /// Pop the most preferred task's job id, if any. Removing a task by
    /// id is intentionally unsupported: once popped a task is being
    /// built and no longer belongs to the queue.
    pub fn pop(&mut self) -> Option<JobId> {
        self.heap.pop().map(|e| e.job_id)
    }

    /// Number of tasks currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True if no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn task(job_id: &str, nice: i32, priority: i32, submitted_at: DateTime<Utc>) -> Task {
        Task {
            job_id: job_id.into(),
            package_key: format!("cat/{job_id}-1.0"),
            version: "1.0".into(),
            priority,
            nice,
            deps: Vec::new(),
            submitted_at,
            assignment: None,
        }
    }

    #[test]
    fn nice_clamping() {
        assert_eq!(clamp_nice(-100), NICE_MIN);
        assert_eq!(clamp_nice(100), NICE_MAX);
        assert_eq!(clamp_nice(0), 0);
    }

    #[test]
    fn pop_order_matches_nice_priority_submit_time() {
        // S3: (nice,priority) = (10,5),(0,5),(-10,5),(0,10)
        let t0 = Utc::now();
        let mut q = PriorityQueue::new();
        q.push(&task("a", 10, 5, t0));
        q.push(&task("b", 0, 5, t0 + chrono::Duration::seconds(1)));
        q.push(&task("c", -10, 5, t0 + chrono::Duration::seconds(2)));
        q.push(&task("d", 0, 10, t0 + chrono::Duration::seconds(3)));

        assert_eq!(q.pop().as_deref(), Some("c"));
        assert_eq!(q.pop().as_deref(), Some("d"));
        assert_eq!(q.pop().as_deref(), Some("b"));
        assert_eq!(q.pop().as_deref(), Some("a"));
        assert!(q.pop().is_none());
    }

    #[test]
    fn tie_break_on_submit_time() {
        let t0 = Utc::now();
        let mut q = PriorityQueue::new();
        q.push(&task("later", 0, 5, t0 + chrono::Duration::seconds(5)));
        q.push(&task("earlier", 0, 5, t0));
        assert_eq!(q.pop().as_deref(), Some("earlier"));
        assert_eq!(q.pop().as_deref(), Some("later"));
    }

    #[test]
    fn len_and_is_empty() {
        let mut q = PriorityQueue::new();
        assert!(q.is_empty());
        q.push(&task("a", 0, 0, Utc::now()));
        assert_eq!(q.len(), 1);
        q.pop();
        assert!(q.is_empty());
    }

    proptest! {
        /// §8 item 6: popping the whole queue always yields a
        /// non-decreasing sort by `(nice, -priority, submitted_at)`,
        /// regardless of push order.
        #[test]
        fn pop_order_is_always_sorted(
            entries in proptest::collection::vec(
                (-30i32..30, -10i32..10, 0i64..1_000_000i64),
                0..50,
            )
        ) {
            let t0 = Utc::now();
            let mut q = PriorityQueue::new();
            for (i, (nice, priority, offset_ms)) in entries.iter().enumerate() {
                let submitted_at = t0 + chrono::Duration::milliseconds(*offset_ms);
                q.push(&task(&format!("job-{i}"), clamp_nice(*nice), *priority, submitted_at));
            }

            let mut expected: Vec<_> = entries
                .into_iter()
                .enumerate()
                .map(|(i, (nice, priority, offset_ms))| (format!("job-{i}"), clamp_nice(nice), priority, offset_ms))
                .collect();
            expected.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)).then_with(|| a.3.cmp(&b.3)));

            let mut popped = Vec::new();
            while let Some(id) = q.pop() {
                popped.push(id);
            }
            let expected_ids: Vec<String> = expected.into_iter().map(|(id, _, _, _)| id).collect();
            prop_assert_eq!(popped, expected_ids);
        }
    }
}
