// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Wire DTOs for the coordinator and builder HTTP APIs (§6.1, §6.2).
//!
//! These types carry no behavior beyond (de)serialization and the
//! occasional narrow conversion into a [`JobRequest`]; validation and
//! routing live at the binary-crate HTTP layer, not here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{BuilderId, JobId, JobRequest, OptionsMap};
use crate::registry::BuilderStatus;

// ---------------------------------------------------------------------
// Coordinator API (§6.1)
// ---------------------------------------------------------------------

/// `POST /api/v1/packages/query` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageQueryRequest {
    /// Package name.
    pub name: String,
    /// Requested version, if pinned.
    #[serde(default)]
    pub version: Option<String>,
    /// Target architecture.
    pub arch: String,
    /// Requested build-time options.
    #[serde(default)]
    pub options: Vec<String>,
}

/// `POST /api/v1/packages/query` response body.
#[derive(Debug, Clone, Serialize)]
pub struct PackageQueryResponse {
    /// Whether the cache holds a satisfying artifact.
    pub found: bool,
    /// Cache-supplied descriptor, opaque to the core. `None` when not found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<serde_json::Value>,
}

/// `POST /api/v1/packages/request-build` accepts either of two
/// historical body shapes; both are normalized to a [`JobRequest`] via
/// [`RequestBuildBody::into_job_request`].
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RequestBuildBody {
    /// `{ package_name, version, arch, use_flags[] }`
    Flat {
        /// Bare package name, no category qualifier.
        package_name: String,
        /// Requested version.
        #[serde(default)]
        version: Option<String>,
        /// Target architecture.
        arch: String,
        /// Use-flag names to enable; unlisted flags default to disabled.
        #[serde(default)]
        use_flags: Vec<String>,
    },
    /// `{ category, package, version, use_flags[] }`
    Categorized {
        /// Package category, e.g. "dev-lang".
        category: String,
        /// Package name within the category.
        package: String,
        /// Requested version.
        #[serde(default)]
        version: Option<String>,
        /// Use-flag names to enable.
        #[serde(default)]
        use_flags: Vec<String>,
    },
}

impl RequestBuildBody {
    /// Normalize either accepted shape into a [`JobRequest`]. The flat
    /// shape has no declared architecture split from category, so its
    /// category defaults to `"default"` and `arch` is taken as given;
    /// the categorized shape carries no explicit arch, so it defaults
    /// to `"any"` (an upstream concern this core does not interpret).
    #[must_use]
    pub fn into_job_request(self) -> JobRequest {
        let options: OptionsMap = match &self {
            Self::Flat { use_flags, .. } | Self::Categorized { use_flags, .. } => {
                use_flags.iter().map(|f| (f.clone(), true)).collect()
            }
        };
        match self {
            Self::Flat { package_name, version, arch, .. } => JobRequest {
                category: "default".into(),
                name: package_name,
                version,
                arch,
                options,
                env: HashMap::new(),
                config_bundle: None,
            },
            Self::Categorized { category, package, version, .. } => JobRequest {
                category,
                name: package,
                version,
                arch: "any".into(),
                options,
                env: HashMap::new(),
                config_bundle: None,
            },
        }
    }
}

/// Response shared by both coordinator and builder `request-build`/`build`
/// endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedJobResponse {
    /// Newly assigned job id.
    pub job_id: JobId,
    /// Always `"queued"` at acceptance time.
    pub status: String,
}

impl AcceptedJobResponse {
    /// Construct the standard `{ job_id, status: "queued" }` body.
    #[must_use]
    pub fn queued(job_id: JobId) -> Self {
        Self { job_id, status: "queued".into() }
    }
}

/// `GET /api/v1/builds/list` query parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildsListQuery {
    /// Maximum number of records to return, clamped to 200.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl BuildsListQuery {
    /// Default limit when none is supplied.
    pub const DEFAULT_LIMIT: usize = 50;
    /// Hard ceiling on `limit` regardless of what the caller requests.
    pub const MAX_LIMIT: usize = 200;

    /// The effective limit: requested value clamped into `[1, 200]`,
    /// defaulting to [`Self::DEFAULT_LIMIT`].
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }
}

/// `POST /api/v1/builders/register` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct BuilderRegisterRequest {
    /// Stable builder identity.
    pub builder_id: BuilderId,
    /// HTTP base URL the coordinator dispatches to.
    pub endpoint: String,
    /// Declared target architecture.
    pub architecture: String,
    /// Maximum concurrent jobs.
    pub capacity: u32,
}

/// `GET /api/v1/gpg/public-key` response when signing is disabled.
#[derive(Debug, Clone, Serialize)]
pub struct GpgKeyUnavailable {
    /// Human-readable reason, always present on the 404 path.
    pub error: String,
}

/// `GET /health` response shared by both coordinator and builder.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the process can answer at all.
    pub status: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self { status: "ok" }
    }
}

/// Generic `{ success: bool }` envelope, used by the heartbeat endpoint
/// and other fire-and-forget acknowledgements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    /// Whether the operation was accepted.
    pub success: bool,
}

impl SuccessResponse {
    /// `{ success: true }`.
    #[must_use]
    pub const fn ok() -> Self {
        Self { success: true }
    }
}

// ---------------------------------------------------------------------
// Builder API (§6.2)
// ---------------------------------------------------------------------

/// `GET /api/v1/status` response body on a builder.
#[derive(Debug, Clone, Serialize)]
pub struct BuilderStatusResponse {
    /// This builder's stable identity.
    pub instance_id: BuilderId,
    /// Declared target architecture.
    pub architecture: String,
    /// Current liveness/enablement status.
    pub status: BuilderStatus,
    /// Configured worker count.
    pub workers: usize,
    /// Maximum concurrent jobs.
    pub capacity: u32,
    /// Jobs currently building.
    pub current_load: u32,
    /// Jobs still queued or waiting on dependencies.
    pub queued: usize,
    /// Jobs currently building (duplicated from `current_load` for
    /// clients that read the per-state breakdown instead).
    pub building: usize,
    /// Jobs that reached `success`.
    pub completed: usize,
    /// Jobs that reached `failed`.
    pub failed: usize,
    /// Host CPU utilization percentage.
    pub cpu_usage: f64,
    /// Host memory utilization percentage.
    pub memory_usage: f64,
    /// Host disk utilization percentage.
    pub disk_usage: f64,
}

/// `GET /api/v1/artifacts/info/{id}` response body.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactInfoResponse {
    /// Owning job id.
    pub job_id: JobId,
    /// Artifact file name.
    pub file_name: String,
    /// Absolute local path to the artifact.
    pub file_path: String,
    /// Artifact size in bytes.
    pub file_size: u64,
    /// Package name the artifact was built from.
    pub package_name: String,
    /// Package version the artifact was built from.
    pub version: String,
}

/// Row shape returned by `/api/v1/builders/status`, which marks
/// unreachable builders offline instead of omitting them.
#[derive(Debug, Clone, Serialize)]
pub struct FleetBuilderStatus {
    /// Builder identity as known to the coordinator's registry.
    pub builder_id: BuilderId,
    /// `true` if the fan-out GET to this builder succeeded.
    pub reachable: bool,
    /// The builder's self-reported status payload, if reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<BuilderStatusResponse>,
    /// Timestamp this entry was produced.
    pub observed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_request_build_body_normalizes_into_job_request() {
        let body: RequestBuildBody = serde_json::from_str(
            r#"{"package_name":"python","version":"3.11","arch":"amd64","use_flags":["sqlite"]}"#,
        )
        .unwrap();
        let req = body.into_job_request();
        assert_eq!(req.category, "default");
        assert_eq!(req.name, "python");
        assert_eq!(req.arch, "amd64");
        assert_eq!(req.options.get("sqlite"), Some(&true));
    }

    #[test]
    fn categorized_request_build_body_normalizes_into_job_request() {
        let body: RequestBuildBody = serde_json::from_str(
            r#"{"category":"dev-lang","package":"python","version":"3.11","use_flags":[]}"#,
        )
        .unwrap();
        let req = body.into_job_request();
        assert_eq!(req.category, "dev-lang");
        assert_eq!(req.name, "python");
        assert_eq!(req.package_key(), "dev-lang/python-3.11");
    }

    #[test]
    fn builds_list_query_clamps_limit() {
        let q = BuildsListQuery { limit: Some(10_000) };
        assert_eq!(q.effective_limit(), BuildsListQuery::MAX_LIMIT);
        let q = BuildsListQuery { limit: None };
        assert_eq!(q.effective_limit(), BuildsListQuery::DEFAULT_LIMIT);
    }
}
