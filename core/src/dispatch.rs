// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Coordinator dispatcher (C10): cache probe, builder selection,
//! forwarding, polling, and fleet-wide status aggregation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::job::{BuilderId, JobId, JobRecord, JobRequest, JobState};
use crate::metrics::MetricsRegistry;
use crate::protocol::{AcceptedJobResponse, BuilderStatusResponse, FleetBuilderStatus};
use crate::registry::{BuilderRecord, BuilderRegistry, BuilderStatus};
use crate::store::JobStore;
use crate::worker_pool::JobTable;

/// Interval between polls of a forwarded job's remote status.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Timeout applied to each leg of a fleet-wide status fan-out.
pub const FANOUT_TIMEOUT: Duration = Duration::from_secs(5);
/// Overall deadline for a forwarded job to reach a terminal state
/// remotely (§4.9 item 4: "at least the executor timeout"). Chosen well
/// above any single build's own timeout so a slow-but-healthy build is
/// never starved by the poller giving up first.
pub const POLL_DEADLINE: Duration = Duration::from_secs(3600);
/// Consecutive poll failures (transient HTTP errors or malformed
/// responses) tolerated before giving up on a forwarded job, independent
/// of the overall deadline.
pub const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 12;

/// External cache lookup (§1: out of scope, narrow interface only).
#[async_trait]
pub trait CacheProbe: Send + Sync {
    /// Look up a cached artifact matching `(name, version, arch, options)`.
    /// Returns `None` on a miss.
    async fn probe(&self, name: &str, version: Option<&str>, arch: &str, options: &[String]) -> Option<serde_json::Value>;
}

/// A probe that never hits, for configurations with no cache backend.
pub struct NoCache;

#[async_trait]
impl CacheProbe for NoCache {
    async fn probe(&self, _name: &str, _version: Option<&str>, _arch: &str, _options: &[String]) -> Option<serde_json::Value> {
        None
    }
}

/// Picks a builder from the set of currently available ones.
/// Implementations may reorder or filter `candidates`; the default is
/// first-fit in declared (registration) order (§4.9).
pub trait BuilderSelector: Send + Sync {
    /// Choose a builder from `candidates`, already filtered to those
    /// not disabled, not at capacity, and healthy. `None` means no
    /// builder can take the job right now.
    fn select(&self, candidates: &[BuilderRecord]) -> Option<BuilderId>;
}

/// First-fit selection in whatever order the registry snapshot supplies.
pub struct FirstFit;

impl BuilderSelector for FirstFit {
    fn select(&self, candidates: &[BuilderRecord]) -> Option<BuilderId> {
        candidates.first().map(|b| b.id.clone())
    }
}

/// Coordinator-side dispatch and polling logic.
pub struct Dispatcher {
    http: reqwest::Client,
    registry: Arc<BuilderRegistry>,
    jobs: JobTable,
    store: Arc<JobStore>,
    cache: Arc<dyn CacheProbe>,
    selector: Arc<dyn BuilderSelector>,
    metrics: Arc<MetricsRegistry>,
    /// Local job id -> (builder endpoint, remote job id), for active polls.
    remote: Arc<parking_lot::RwLock<HashMap<JobId, (String, String)>>>,
}

impl Dispatcher {
    /// Construct a dispatcher over shared coordinator state.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        registry: Arc<BuilderRegistry>,
        jobs: JobTable,
        store: Arc<JobStore>,
        cache: Arc<dyn CacheProbe>,
        selector: Arc<dyn BuilderSelector>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self { http, registry, jobs, store, cache, selector, metrics, remote: Arc::new(parking_lot::RwLock::new(HashMap::new())) }
    }

    /// Accept a new client request: probe the cache, and on a miss,
    /// select and forward to a builder. Returns the newly created local
    /// job id. The caller is responsible for spawning the returned
    /// polling future (if any) onto its own runtime.
    ///
    /// Every accepted request is recorded as started exactly once here,
    /// and as terminal exactly once -- either synchronously below (cache
    /// hit, no builder available) or later from [`Self::poll_until_terminal`]
    /// once the forwarded job reaches a terminal state or polling gives up.
    pub async fn accept(&self, request: JobRequest) -> CoreResult<(JobId, Option<impl std::future::Future<Output = ()> + '_>)> {
        let job_id = uuid::Uuid::new_v4().to_string();
        self.metrics.record_job_started();

        if let Some(descriptor) = self
            .cache
            .probe(&request.name, request.version.as_deref(), &request.arch, &[])
            .await
        {
            let mut record = JobRecord::new(job_id.clone(), request, JobState::Building);
            record.mark_building("cache".into());
            record.result.artifact_url = descriptor.get("url").and_then(|v| v.as_str()).map(String::from);
            record.mark_terminal(true, None);
            self.insert_and_persist(record);
            self.metrics.record_job_terminal(true);
            info!(job_id, "cache hit, resolved synchronously");
            return Ok((job_id, None));
        }

        let candidates: Vec<BuilderRecord> = self.registry.list().into_iter().filter(BuilderRecord::is_available).collect();
        let Some(builder_id) = self.selector.select(&candidates) else {
            let mut record = JobRecord::new(job_id.clone(), request, JobState::Queued);
            record.mark_terminal(false, Some("no builder available".into()));
            self.insert_and_persist(record);
            self.metrics.record_job_terminal(false);
            return Ok((job_id, None));
        };
        let builder = self.registry.get(&builder_id).ok_or_else(|| CoreError::NotFound(builder_id.clone()))?;

        let mut record = JobRecord::new(job_id.clone(), request.clone(), JobState::Forwarding);
        record.assignment = Some(builder_id.clone());
        self.insert_and_persist(record);

        let url = format!("{}/api/v1/build", builder.endpoint.trim_end_matches('/'));
        let accepted: AcceptedJobResponse = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| CoreError::TransientRemote { target: builder.endpoint.clone(), message: e.to_string() })?
            .json()
            .await
            .map_err(|e| CoreError::TransientRemote { target: builder.endpoint.clone(), message: e.to_string() })?;

        self.remote.write().insert(job_id.clone(), (builder.endpoint.clone(), accepted.job_id.clone()));
        if let Some(job) = self.jobs.write().get_mut(&job_id) {
            job.state = JobState::Building;
            job.remote_job_id = Some(accepted.job_id);
        }
        self.persist();

        let job_id_for_poll = job_id.clone();
        Ok((job_id.clone(), Some(self.poll_until_terminal(job_id_for_poll))))
    }

    /// Poll `/api/v1/jobs/{remote_id}` on the owning builder every
    /// [`POLL_INTERVAL`] until the remote job reaches a terminal state,
    /// the local record disappears, [`POLL_DEADLINE`] elapses, or
    /// [`MAX_CONSECUTIVE_POLL_ERRORS`] poll attempts in a row fail --
    /// whichever comes first. Exceeding either bound marks the job
    /// `Failed` locally (mirroring [`Scheduler::complete_task`]'s
    /// terminal-write pattern) since a forwarded job that never reports
    /// back must still reach a terminal state for the caller.
    ///
    /// [`Scheduler::complete_task`]: crate::scheduler::Scheduler::complete_task
    pub async fn poll_until_terminal(&self, job_id: JobId) {
        self.poll_until_terminal_with(job_id, POLL_INTERVAL, POLL_DEADLINE, MAX_CONSECUTIVE_POLL_ERRORS).await;
    }

    /// Parameterized so tests can exercise the deadline/error-cap paths
    /// without waiting on the production [`POLL_INTERVAL`]/[`POLL_DEADLINE`].
    async fn poll_until_terminal_with(&self, job_id: JobId, poll_interval: Duration, poll_deadline: Duration, max_consecutive_errors: u32) {
        let mut ticker = tokio::time::interval(poll_interval);
        let deadline = tokio::time::Instant::now() + poll_deadline;
        let mut consecutive_errors = 0u32;

        loop {
            ticker.tick().await;
            let Some((endpoint, remote_id)) = self.remote.read().get(&job_id).cloned() else {
                break;
            };

            if tokio::time::Instant::now() >= deadline {
                warn!(job_id, "poll deadline exceeded, marking job failed");
                self.fail_forwarded_job(&job_id, "polling deadline exceeded awaiting remote build");
                break;
            }

            let url = format!("{}/api/v1/jobs/{}", endpoint.trim_end_matches('/'), remote_id);
            match self.http.get(&url).timeout(FANOUT_TIMEOUT).send().await {
                Ok(resp) => match resp.json::<JobRecord>().await {
                    Ok(remote_record) => {
                        consecutive_errors = 0;
                        let terminal = remote_record.state.is_terminal();
                        if let Some(job) = self.jobs.write().get_mut(&job_id) {
                            job.state = remote_record.state;
                            job.result = remote_record.result;
                            job.ended_at = remote_record.ended_at;
                        }
                        self.persist();
                        if terminal {
                            self.remote.write().remove(&job_id);
                            self.metrics.record_job_terminal(remote_record.state == JobState::Success);
                            break;
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!(job_id, error = %e, consecutive_errors, "malformed poll response from builder");
                    }
                },
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(job_id, error = %e, consecutive_errors, "transient error polling builder");
                }
            }

            if consecutive_errors >= max_consecutive_errors {
                warn!(job_id, consecutive_errors, "persistent poll failure, marking job failed");
                self.fail_forwarded_job(&job_id, "persistent error polling remote build status");
                break;
            }
        }
    }

    /// Force a forwarded job to `Failed`, used when polling gives up
    /// without ever observing a remote terminal state.
    fn fail_forwarded_job(&self, job_id: &JobId, reason: &str) {
        let mut already_terminal = true;
        if let Some(job) = self.jobs.write().get_mut(job_id) {
            already_terminal = job.state.is_terminal();
            if !already_terminal {
                job.mark_terminal(false, Some(reason.to_string()));
            }
        }
        self.remote.write().remove(job_id);
        self.persist();
        if !already_terminal {
            self.metrics.record_job_terminal(false);
        }
    }

    /// Fan out a `GET /api/v1/status` to every registered builder with
    /// a [`FANOUT_TIMEOUT`] per call, tolerating unreachable builders by
    /// marking them offline rather than failing the whole listing.
    pub async fn fleet_status(&self) -> Vec<FleetBuilderStatus> {
        let builders = self.registry.list();
        let mut out = Vec::with_capacity(builders.len());
        for b in builders {
            let url = format!("{}/api/v1/status", b.endpoint.trim_end_matches('/'));
            let entry = match self.http.get(&url).timeout(FANOUT_TIMEOUT).send().await {
                Ok(resp) => match resp.json::<BuilderStatusResponse>().await {
                    Ok(detail) => FleetBuilderStatus { builder_id: b.id, reachable: true, detail: Some(detail), observed_at: Utc::now() },
                    Err(_) => FleetBuilderStatus { builder_id: b.id, reachable: false, detail: None, observed_at: Utc::now() },
                },
                Err(_) => {
                    self.registry.set_health(&b.id, false);
                    FleetBuilderStatus { builder_id: b.id, reachable: false, detail: None, observed_at: Utc::now() }
                }
            };
            out.push(entry);
        }
        out
    }

    fn insert_and_persist(&self, record: JobRecord) {
        self.jobs.write().insert(record.id.clone(), record);
        self.persist();
    }

    fn persist(&self) {
        let snapshot = self.jobs.read().clone();
        if let Err(e) = self.store.save(&snapshot) {
            warn!(error = %e, "failed to persist coordinator job table");
        }
    }
}

/// Merge a locally known build listing with remote listings fetched
/// from each builder, de-duplicating by job id with local copies
/// winning (§4.9, open question: id-collision semantics across
/// independently-run builders are otherwise unresolved).
#[must_use]
pub fn merge_build_listings(local: Vec<JobRecord>, remote: Vec<Vec<JobRecord>>) -> Vec<JobRecord> {
    let mut merged: HashMap<JobId, JobRecord> = HashMap::new();
    for batch in remote {
        for job in batch {
            merged.insert(job.id.clone(), job);
        }
    }
    for job in local {
        merged.insert(job.id.clone(), job);
    }
    let mut out: Vec<JobRecord> = merged.into_values().collect();
    out.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> JobRequest {
        JobRequest {
            category: "dev-lang".into(),
            name: "python".into(),
            version: Some("3.11".into()),
            arch: "amd64".into(),
            options: Map::new(),
            env: Map::new(),
            config_bundle: None,
        }
    }

    fn new_dispatcher(cache: Arc<dyn CacheProbe>) -> (Dispatcher, Arc<BuilderRegistry>, JobTable, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().join("jobs.json")).unwrap());
        let registry = Arc::new(BuilderRegistry::new());
        let jobs: JobTable = Arc::new(parking_lot::RwLock::new(HashMap::new()));
        let dispatcher = Dispatcher::new(reqwest::Client::new(), registry.clone(), jobs.clone(), store, cache, Arc::new(FirstFit), Arc::new(MetricsRegistry::new()));
        (dispatcher, registry, jobs, dir)
    }

    struct AlwaysHit;
    #[async_trait]
    impl CacheProbe for AlwaysHit {
        async fn probe(&self, _name: &str, _version: Option<&str>, _arch: &str, _options: &[String]) -> Option<serde_json::Value> {
            Some(serde_json::json!({ "url": "https://cache.example/python-3.11.tbz2" }))
        }
    }

    #[tokio::test]
    async fn cache_hit_resolves_job_synchronously() {
        let (dispatcher, _registry, jobs, _dir) = new_dispatcher(Arc::new(AlwaysHit));
        let (job_id, poll) = dispatcher.accept(sample_request()).await.unwrap();
        assert!(poll.is_none());
        let job = jobs.read().get(&job_id).unwrap().clone();
        assert_eq!(job.state, JobState::Success);
        assert_eq!(job.result.artifact_url.as_deref(), Some("https://cache.example/python-3.11.tbz2"));

        // A job resolved synchronously still records a start/terminal
        // pair, so jobs_in_flight nets back to zero instead of leaking.
        assert_eq!(dispatcher.metrics.jobs_in_flight.get(), 0);
        assert_eq!(dispatcher.metrics.jobs_total.with_label_values(&["success"]).get(), 1);
    }

    #[tokio::test]
    async fn no_available_builder_fails_job_immediately() {
        let (dispatcher, _registry, jobs, _dir) = new_dispatcher(Arc::new(NoCache));
        let (job_id, poll) = dispatcher.accept(sample_request()).await.unwrap();
        assert!(poll.is_none());
        let job = jobs.read().get(&job_id).unwrap().clone();
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn forward_to_builder_then_poll_to_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/build"))
            .respond_with(ResponseTemplate::new(202).set_body_json(AcceptedJobResponse::queued("remote-1".into())))
            .mount(&server)
            .await;

        let (dispatcher, registry, jobs, _dir) = new_dispatcher(Arc::new(NoCache));
        registry.register("b1".into(), server.uri(), "amd64".into(), 2);

        let (job_id, poll) = dispatcher.accept(sample_request()).await.unwrap();
        assert!(poll.is_some());

        let mut remote_job = JobRecord::new("remote-1".into(), sample_request(), JobState::Building);
        remote_job.mark_terminal(true, None);
        Mock::given(method("GET"))
            .and(path("/api/v1/jobs/remote-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&remote_job))
            .mount(&server)
            .await;

        tokio::time::timeout(Duration::from_secs(2), poll.unwrap()).await.unwrap();

        let job = jobs.read().get(&job_id).unwrap().clone();
        assert_eq!(job.state, JobState::Success);
        assert_eq!(dispatcher.metrics.jobs_in_flight.get(), 0);
        assert_eq!(dispatcher.metrics.jobs_total.with_label_values(&["success"]).get(), 1);
    }

    #[tokio::test]
    async fn fleet_status_marks_unreachable_builders() {
        let (dispatcher, registry, _jobs, _dir) = new_dispatcher(Arc::new(NoCache));
        registry.register("ghost".into(), "http://127.0.0.1:1".into(), "amd64".into(), 1);

        let statuses = dispatcher.fleet_status().await;
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].reachable);
        assert_eq!(registry.get("ghost").unwrap().status, BuilderStatus::Offline);
    }

    #[tokio::test]
    async fn persistent_poll_errors_fail_the_job_after_the_cap() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/build"))
            .respond_with(ResponseTemplate::new(202).set_body_json(AcceptedJobResponse::queued("remote-1".into())))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/jobs/remote-1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (dispatcher, registry, jobs, _dir) = new_dispatcher(Arc::new(NoCache));
        registry.register("b1".into(), server.uri(), "amd64".into(), 2);

        let (job_id, _poll) = dispatcher.accept(sample_request()).await.unwrap();
        dispatcher
            .poll_until_terminal_with(job_id.clone(), Duration::from_millis(1), Duration::from_secs(60), 3)
            .await;

        let job = jobs.read().get(&job_id).unwrap().clone();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.result.failure_reason.as_deref(), Some("persistent error polling remote build status"));
        assert_eq!(dispatcher.metrics.jobs_in_flight.get(), 0);
        assert_eq!(dispatcher.metrics.jobs_total.with_label_values(&["failed"]).get(), 1);
    }

    #[tokio::test]
    async fn poll_deadline_fails_the_job_even_without_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/build"))
            .respond_with(ResponseTemplate::new(202).set_body_json(AcceptedJobResponse::queued("remote-1".into())))
            .mount(&server)
            .await;
        let still_building = JobRecord::new("remote-1".into(), sample_request(), JobState::Building);
        Mock::given(method("GET"))
            .and(path("/api/v1/jobs/remote-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&still_building))
            .mount(&server)
            .await;

        let (dispatcher, registry, jobs, _dir) = new_dispatcher(Arc::new(NoCache));
        registry.register("b1".into(), server.uri(), "amd64".into(), 2);

        let (job_id, _poll) = dispatcher.accept(sample_request()).await.unwrap();
        dispatcher
            .poll_until_terminal_with(job_id.clone(), Duration::from_millis(1), Duration::from_millis(5), 1000)
            .await;

        let job = jobs.read().get(&job_id).unwrap().clone();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.result.failure_reason.as_deref(), Some("polling deadline exceeded awaiting remote build"));
    }

    #[test]
    fn merge_build_listings_prefers_local_on_id_collision() {
        let mut local_job = JobRecord::new("j1".into(), sample_request(), JobState::Building);
        local_job.result.log = "local view".into();
        let mut remote_job = JobRecord::new("j1".into(), sample_request(), JobState::Building);
        remote_job.result.log = "remote view".into();

        let merged = merge_build_listings(vec![local_job], vec![vec![remote_job]]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].result.log, "local view");
    }
}
