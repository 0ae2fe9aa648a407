// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Builder HTTP API (§6.2).

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use buildfarm_core::error::CoreError;
use buildfarm_core::job::{JobRecord, JobRequest, JobState};
use buildfarm_core::protocol::{
    AcceptedJobResponse, ArtifactInfoResponse, BuilderStatusResponse, BuildsListQuery, HealthResponse,
};
use tokio_util::io::ReaderStream;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the full builder router, including permissive CORS and
/// request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/build", post(build))
        .route("/api/v1/jobs/:id", get(job_detail))
        .route("/api/v1/jobs", get(jobs_list))
        .route("/api/v1/status", get(status))
        .route("/api/v1/artifacts/info/:id", get(artifact_info))
        .route("/api/v1/artifacts/download/:id", get(artifact_download))
        .route("/health", get(health))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

async fn build(State(state): State<AppState>, Json(request): Json<JobRequest>) -> Result<(StatusCode, Json<AcceptedJobResponse>), ApiError> {
    let job_id = uuid::Uuid::new_v4().to_string();
    let record = JobRecord::new(job_id.clone(), request, JobState::Queued);
    state.jobs.write().insert(job_id.clone(), record);
    state.store.save(&state.jobs.read().clone()).map_err(|e| ApiError::from(CoreError::Durability(e.to_string())))?;

    state.pool.submit(job_id.clone()).map_err(|e| ApiError::from(CoreError::Capacity(e)))?;

    Ok((StatusCode::ACCEPTED, Json(AcceptedJobResponse::queued(job_id))))
}

async fn job_detail(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Result<Json<JobRecord>, ApiError> {
    state.jobs.read().get(&id).cloned().map(Json).ok_or_else(|| ApiError::from(CoreError::NotFound(id)))
}

async fn jobs_list(State(state): State<AppState>, axum::extract::Query(q): axum::extract::Query<BuildsListQuery>) -> Json<Vec<JobRecord>> {
    let mut jobs = state.local_jobs_newest_first();
    jobs.truncate(q.effective_limit());
    Json(jobs)
}

async fn status(State(state): State<AppState>) -> Json<BuilderStatusResponse> {
    let jobs = state.jobs.read();
    let building = jobs.values().filter(|j| j.state == JobState::Building).count();
    let queued = jobs.values().filter(|j| j.state == JobState::Queued).count();
    let completed = jobs.values().filter(|j| j.state == JobState::Success).count();
    let failed = jobs.values().filter(|j| j.state == JobState::Failed).count();
    let resources = state.resources();
    drop(jobs);

    Json(BuilderStatusResponse {
        instance_id: state.config.builder_id.clone(),
        architecture: state.config.architecture.clone(),
        status: state.status(),
        workers: state.config.workers,
        capacity: state.config.capacity,
        current_load: building as u32,
        queued,
        building,
        completed,
        failed,
        cpu_usage: resources.cpu_percent,
        memory_usage: resources.mem_percent,
        disk_usage: resources.disk_percent,
    })
}

async fn artifact_info(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Result<Json<ArtifactInfoResponse>, ApiError> {
    let (artifact_url, package_name, version) = {
        let jobs = state.jobs.read();
        let job = jobs.get(&id).ok_or_else(|| ApiError::from(CoreError::NotFound(id.clone())))?;
        let artifact_url = job.result.artifact_url.clone().ok_or_else(|| ApiError::from(CoreError::NotFound(id.clone())))?;
        (artifact_url, job.request.atom(), job.request.version.clone().unwrap_or_else(|| "unknown".into()))
    };
    let path = std::path::PathBuf::from(&artifact_url);
    let metadata = tokio::fs::metadata(&path).await.map_err(|_| ApiError::from(CoreError::NotFound(id.clone())))?;

    Ok(Json(ArtifactInfoResponse {
        job_id: id,
        file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        file_path: path.to_string_lossy().into_owned(),
        file_size: metadata.len(),
        package_name,
        version,
    }))
}

async fn artifact_download(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Result<Response, ApiError> {
    let artifact_url = {
        let jobs = state.jobs.read();
        let job = jobs.get(&id).ok_or_else(|| ApiError::from(CoreError::NotFound(id.clone())))?;
        job.result.artifact_url.clone().ok_or_else(|| ApiError::from(CoreError::NotFound(id.clone())))?
    };

    let path = std::path::PathBuf::from(&artifact_url);
    let file = tokio::fs::File::open(&path).await.map_err(|_| ApiError::from(CoreError::NotFound(id)))?;
    let stream = ReaderStream::new(file);
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "artifact".into());

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{file_name}\""))
        .body(Body::from_stream(stream))
        .expect("well-formed download response"))
}
