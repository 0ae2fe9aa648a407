// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Job record (C1): the typed record of a build request plus its
//! lifecycle state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque job identity. Treated as uninterpreted by every consumer.
pub type JobId = String;

/// Opaque builder identity.
pub type BuilderId = String;

/// Canonical "category/name-version" key used in the completed set and
/// in dependency lists.
pub type PackageKey = String;

/// Lifecycle state of a job. Transitions are monotonic along the DAG
/// described in the data model: `{Queued, WaitingDeps} -> Ready ->
/// Forwarding -> Building -> {Success, Failed}`. Once a job reaches
/// `Success` or `Failed` its state is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet admitted to the ready queue.
    Queued,
    /// Holding for unmet dependencies.
    WaitingDeps,
    /// In the priority queue, eligible for selection.
    Ready,
    /// Selected and being forwarded to a remote builder (coordinator only).
    Forwarding,
    /// Owned by exactly one builder, actively executing.
    Building,
    /// Terminal: build succeeded and an artifact was published.
    Success,
    /// Terminal: build failed for any reason in the error taxonomy.
    Failed,
}

impl JobState {
    /// True for `Success` and `Failed`, the only states a job cannot
    /// leave once entered.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Requested build-time options: a mapping from option name to
/// enabled/disabled (the package manager's "use flags").
pub type OptionsMap = HashMap<String, bool>;

/// The request side of a job: everything the client supplied at
/// submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Package category, e.g. "dev-lang".
    pub category: String,
    /// Package name, e.g. "python".
    pub name: String,
    /// Requested version, if the client pinned one.
    pub version: Option<String>,
    /// Target architecture.
    pub arch: String,
    /// Build-time options (use flags).
    #[serde(default)]
    pub options: OptionsMap,
    /// Environment variable overrides for the build.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Opaque configuration bundle carried through to the executor
    /// (package-use/keywords/masks/repositories/package specs). The core
    /// does not interpret its contents.
    #[serde(default)]
    pub config_bundle: Option<serde_json::Value>,
}

impl JobRequest {
    /// The package atom "category/name".
    #[must_use]
    pub fn atom(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// The canonical package key "category/name-version", using the
    /// requested version or `"unknown"` when unset.
    #[must_use]
    pub fn package_key(&self) -> PackageKey {
        package_key(&self.category, &self.name, self.version.as_deref().unwrap_or("unknown"))
    }
}

/// Build the canonical "category/name-version" package key.
#[must_use]
pub fn package_key(category: &str, name: &str, version: &str) -> PackageKey {
    format!("{category}/{name}-{version}")
}

/// Outcome fields populated as a job progresses and terminates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResult {
    /// URL or local path of the published artifact, once known.
    #[serde(default)]
    pub artifact_url: Option<String>,
    /// Non-empty failure reason, set only on terminal failure. The
    /// build log is appended for diagnostic visibility.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Freeform metadata (e.g. `signed`, `uploaded`) set by the
    /// artifact pipeline.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Append-only combined stdout+stderr build log.
    #[serde(default)]
    pub log: String,
}

/// The full job record as persisted and returned by status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Opaque unique id, assigned on acceptance.
    pub id: JobId,
    /// What was requested.
    pub request: JobRequest,
    /// Current lifecycle state.
    pub state: JobState,
    /// Set on acceptance, always present.
    pub submitted_at: DateTime<Utc>,
    /// Set on transition to `Building`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on transition to a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Builder identity, once dispatched.
    pub assignment: Option<BuilderId>,
    /// For coordinator-side jobs: the remote builder's job id.
    #[serde(default)]
    pub remote_job_id: Option<String>,
    /// Accumulated result fields.
    #[serde(default)]
    pub result: JobResult,
}

impl JobRecord {
    /// Create a freshly submitted job record.
    #[must_use]
    pub fn new(id: JobId, request: JobRequest, state: JobState) -> Self {
        Self {
            id,
            request,
            state,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            assignment: None,
            remote_job_id: None,
            result: JobResult::default(),
        }
    }

    /// Transition to `Building`, recording the owning builder and start
    /// time. Invariant 3 (`ended >= started >= submitted`) is preserved
    /// because `started_at` is always set from `Utc::now()` which is
    /// monotonic with respect to `submitted_at`.
    pub fn mark_building(&mut self, builder: BuilderId) {
        self.state = JobState::Building;
        self.assignment = Some(builder);
        self.started_at = Some(Utc::now());
    }

    /// Transition to a terminal state. No-op if already terminal, which
    /// keeps `CompleteTask` idempotent per the scheduler contract.
    pub fn mark_terminal(&mut self, success: bool, reason: Option<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = if success { JobState::Success } else { JobState::Failed };
        self.ended_at = Some(Utc::now());
        if let Some(reason) = reason {
            let mut combined = reason;
            if !self.result.log.is_empty() {
                combined.push_str("\n--- build log ---\n");
                combined.push_str(&self.result.log);
            }
            self.result.failure_reason = Some(combined);
        }
    }

    /// The package key this job contributes to the completed set on
    /// success.
    #[must_use]
    pub fn package_key(&self) -> PackageKey {
        self.request.package_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn package_key_format() {
        let req = sample_request();
        assert_eq!(req.package_key(), "dev-lang/python-3.11");
        assert_eq!(req.atom(), "dev-lang/python");
    }

    #[test]
    fn terminal_state_is_immutable_once_set() {
        let mut job = JobRecord::new("j1".into(), sample_request(), JobState::Queued);
        job.mark_building("b1".into());
        assert_eq!(job.state, JobState::Building);
        job.mark_terminal(true, None);
        assert_eq!(job.state, JobState::Success);
        let ended_at = job.ended_at;
        // A second terminal transition must not happen.
        job.mark_terminal(false, Some("late failure".into()));
        assert_eq!(job.state, JobState::Success);
        assert_eq!(job.ended_at, ended_at);
    }

    #[test]
    fn timestamps_are_monotonic() {
        let mut job = JobRecord::new("j1".into(), sample_request(), JobState::Queued);
        job.mark_building("b1".into());
        job.mark_terminal(true, None);
        assert!(job.started_at.unwrap() >= job.submitted_at);
        assert!(job.ended_at.unwrap() >= job.started_at.unwrap());
    }

    #[test]
    fn failure_reason_includes_log() {
        let mut job = JobRecord::new("j1".into(), sample_request(), JobState::Queued);
        job.result.log = "compiling...\nerror: foo".into();
        job.mark_terminal(false, Some("build failed".into()));
        let reason = job.result.failure_reason.unwrap();
        assert!(reason.starts_with("build failed"));
        assert!(reason.contains("compiling..."));
    }
}
