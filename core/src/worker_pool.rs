// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker pool (C6): a fixed number of workers consuming a bounded
//! channel of pending jobs.
//!
//! Submission never blocks: a full channel fails fast with
//! [`CapacityError::QueueFull`] rather than making the caller wait.
//! Each worker's loop is: take job -> transition to building -> invoke
//! the executor -> record the terminal state -> persist -> notify.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::CapacityError;
use crate::job::{JobId, JobRecord, JobRequest, JobResult};
use crate::store::JobStore;

/// Runs one job to completion. Implementations compose the sandbox
/// executor (C7) and the artifact pipeline (C8); the worker pool itself
/// is agnostic to how a job is actually built.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Build `job_id`. On success returns the populated result (artifact
    /// url, metadata, log). On failure returns a human-readable reason
    /// plus whatever partial result (typically just the log) should
    /// still be recorded.
    async fn execute(&self, job_id: &JobId, request: &JobRequest) -> Result<JobResult, (String, JobResult)>;
}

/// Shared, lock-guarded job table. Both the HTTP layer and the worker
/// pool hold a clone of this `Arc`.
pub type JobTable = Arc<RwLock<HashMap<JobId, JobRecord>>>;

/// A fixed-size pool of workers draining a bounded job queue.
pub struct WorkerPool {
    tx: mpsc::Sender<JobId>,
    capacity: usize,
    notify: broadcast::Sender<JobId>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` worker tasks consuming a channel bounded at
    /// `capacity`. `builder_id` identifies this process in job
    /// assignment fields. Every job taken off the channel must already
    /// be present in `jobs` (the HTTP layer inserts it at submission
    /// time before calling [`WorkerPool::submit`]). `active_jobs` is
    /// incremented while a job is actually building and decremented the
    /// moment it reaches a terminal state, so it reflects the real
    /// concurrent job count a caller can report in its own heartbeat or
    /// status payload.
    #[must_use]
    pub fn spawn(
        workers: usize,
        capacity: usize,
        builder_id: String,
        jobs: JobTable,
        store: Arc<JobStore>,
        executor: Arc<dyn JobExecutor>,
        active_jobs: Arc<AtomicU32>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (notify, _) = broadcast::channel(1024);

        let mut handles = Vec::with_capacity(workers);
        for worker_index in 0..workers {
            let rx = rx.clone();
            let jobs = jobs.clone();
            let store = store.clone();
            let executor = executor.clone();
            let builder_id = builder_id.clone();
            let notify = notify.clone();
            let active_jobs = active_jobs.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let job_id = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job_id) = job_id else {
                        info!(worker_index, "worker pool channel closed, exiting");
                        break;
                    };
                    run_one(&job_id, &builder_id, &jobs, &store, executor.as_ref(), &active_jobs).await;
                    let _ = notify.send(job_id);
                }
            }));
        }

        Self { tx, capacity, notify, handles }
    }

    /// Enqueue `job_id` for execution. Fails immediately, without
    /// blocking, if the channel is at capacity or the pool has been
    /// shut down.
    pub fn submit(&self, job_id: JobId) -> Result<(), CapacityError> {
        self.tx.try_send(job_id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CapacityError::QueueFull(self.capacity),
            mpsc::error::TrySendError::Closed(_) => CapacityError::QueueFull(self.capacity),
        })
    }

    /// Subscribe to terminal-job notifications, used by long-poll status
    /// endpoints to wake promptly instead of only on their own interval.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobId> {
        self.notify.subscribe()
    }

    /// Close the input channel and wait for every worker to drain and
    /// exit. Jobs already in flight are allowed to finish; nothing new
    /// is accepted once this call begins.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked during shutdown");
            }
        }
    }
}

async fn run_one(job_id: &JobId, builder_id: &str, jobs: &JobTable, store: &Arc<JobStore>, executor: &dyn JobExecutor, active_jobs: &AtomicU32) {
    let Some(request) = begin_building(job_id, builder_id, jobs) else {
        warn!(job_id, "worker popped a job id with no matching record; dropping");
        return;
    };
    active_jobs.fetch_add(1, Ordering::SeqCst);
    persist(jobs, store);

    let outcome = executor.execute(job_id, &request).await;
    record_terminal(job_id, jobs, outcome);
    active_jobs.fetch_sub(1, Ordering::SeqCst);
    persist(jobs, store);
}

fn begin_building(job_id: &JobId, builder_id: &str, jobs: &JobTable) -> Option<JobRequest> {
    let mut jobs = jobs.write();
    let job = jobs.get_mut(job_id)?;
    job.mark_building(builder_id.to_string());
    Some(job.request.clone())
}

fn record_terminal(job_id: &JobId, jobs: &JobTable, outcome: Result<JobResult, (String, JobResult)>) {
    let mut jobs = jobs.write();
    let Some(job) = jobs.get_mut(job_id) else {
        warn!(job_id, "job disappeared from table before terminal state could be recorded");
        return;
    };
    match outcome {
        Ok(result) => {
            job.result = result;
            job.mark_terminal(true, None);
        }
        Err((reason, partial)) => {
            job.result = partial;
            job.mark_terminal(false, Some(reason));
        }
    }
}

fn persist(jobs: &JobTable, store: &Arc<JobStore>) {
    let snapshot = jobs.read().clone();
    if let Err(e) = store.save(&snapshot) {
        error!(error = %e, "failed to persist job table after worker transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::job::{JobRequest, JobState};

    fn sample_request() -> JobRequest {
        JobRequest {
            category: "dev-lang".into(),
            name: "python".into(),
            version: Some("3.11".into()),
            arch: "amd64".into(),
            options: HashMap::new(),
            env: HashMap::new(),
            config_bundle: None,
        }
    }

    struct AlwaysSucceeds {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobExecutor for AlwaysSucceeds {
        async fn execute(&self, _job_id: &JobId, _request: &JobRequest) -> Result<JobResult, (String, JobResult)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(JobResult { artifact_url: Some("file:///out.tbz2".into()), ..Default::default() })
        }
    }

    struct SlowSucceeds {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl JobExecutor for SlowSucceeds {
        async fn execute(&self, _job_id: &JobId, _request: &JobRequest) -> Result<JobResult, (String, JobResult)> {
            self.gate.notified().await;
            Ok(JobResult::default())
        }
    }

    #[tokio::test]
    async fn active_jobs_counts_only_while_building() {
        let (jobs, store, _dir) = new_table_with("j1");
        let gate = Arc::new(tokio::sync::Notify::new());
        let active_jobs = Arc::new(AtomicU32::new(0));
        let pool = WorkerPool::spawn(1, 4, "builder-1".into(), jobs.clone(), store, Arc::new(SlowSucceeds { gate: gate.clone() }), active_jobs.clone());

        pool.submit("j1".into()).unwrap();
        for _ in 0..200 {
            if active_jobs.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(active_jobs.load(Ordering::SeqCst), 1);

        gate.notify_one();
        wait_terminal(&jobs, "j1").await;
        assert_eq!(active_jobs.load(Ordering::SeqCst), 0);

        pool.shutdown().await;
    }

    struct AlwaysFails;

    #[async_trait]
    impl JobExecutor for AlwaysFails {
        async fn execute(&self, _job_id: &JobId, _request: &JobRequest) -> Result<JobResult, (String, JobResult)> {
            Err(("build exited non-zero: 1".into(), JobResult { log: "error: foo".into(), ..Default::default() }))
        }
    }

    fn new_table_with(job_id: &str) -> (JobTable, Arc<JobStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().join("jobs.json")).unwrap());
        let record = JobRecord::new(job_id.into(), sample_request(), JobState::Ready);
        let mut map = HashMap::new();
        map.insert(job_id.to_string(), record);
        (Arc::new(RwLock::new(map)), store, dir)
    }

    async fn wait_terminal(jobs: &JobTable, job_id: &str) {
        for _ in 0..200 {
            if jobs.read().get(job_id).map(|j| j.state.is_terminal()).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn successful_job_transitions_to_success_and_persists() {
        let (jobs, store, _dir) = new_table_with("j1");
        let calls = Arc::new(AtomicUsize::new(0));
        let active_jobs = Arc::new(AtomicU32::new(0));
        let pool = WorkerPool::spawn(
            2,
            4,
            "builder-1".into(),
            jobs.clone(),
            store.clone(),
            Arc::new(AlwaysSucceeds { calls: calls.clone() }),
            active_jobs.clone(),
        );

        pool.submit("j1".into()).unwrap();
        wait_terminal(&jobs, "j1").await;

        let job = jobs.read().get("j1").unwrap().clone();
        assert_eq!(job.state, JobState::Success);
        assert_eq!(job.assignment.as_deref(), Some("builder-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(active_jobs.load(Ordering::SeqCst), 0);

        let persisted = store.load().unwrap();
        assert_eq!(persisted["j1"].state, JobState::Success);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn failed_job_transitions_to_failed_with_reason_and_log() {
        let (jobs, store, _dir) = new_table_with("j1");
        let pool = WorkerPool::spawn(1, 4, "builder-1".into(), jobs.clone(), store, Arc::new(AlwaysFails), Arc::new(AtomicU32::new(0)));

        pool.submit("j1".into()).unwrap();
        wait_terminal(&jobs, "j1").await;

        let job = jobs.read().get("j1").unwrap().clone();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.result.failure_reason.unwrap().starts_with("build exited non-zero: 1"));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submission_beyond_capacity_fails_fast_without_blocking() {
        let (jobs, store, _dir) = new_table_with("j1");
        for id in ["j2", "j3"] {
            jobs.write().insert(id.to_string(), JobRecord::new(id.into(), sample_request(), JobState::Ready));
        }
        // Zero workers: nothing ever drains the channel, so the second
        // submission beyond capacity 1 must fail immediately.
        let pool = WorkerPool::spawn(0, 1, "builder-1".into(), jobs, store, Arc::new(AlwaysFails), Arc::new(AtomicU32::new(0)));

        pool.submit("j1".into()).unwrap();
        let err = pool.submit("j2".into()).unwrap_err();
        assert_eq!(err, CapacityError::QueueFull(1));

        pool.shutdown().await;
    }
}
