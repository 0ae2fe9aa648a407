// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Coordinator HTTP API (§6.1).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use buildfarm_core::error::CoreError;
use buildfarm_core::heartbeat::HeartbeatPayload;
use buildfarm_core::protocol::{
    AcceptedJobResponse, BuilderRegisterRequest, BuildsListQuery, HealthResponse, PackageQueryRequest,
    PackageQueryResponse, RequestBuildBody, SuccessResponse,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the full coordinator router, including permissive CORS and
/// request tracing (§6.1, §6.5).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/packages/query", post(packages_query))
        .route("/api/v1/packages/request-build", post(packages_request_build))
        .route("/api/v1/packages/status", get(packages_status))
        .route("/api/v1/builds/list", get(builds_list))
        .route("/api/v1/builds/logs", get(builds_logs))
        .route("/api/v1/cluster/status", get(cluster_status))
        .route("/api/v1/builders/register", post(builders_register))
        .route("/api/v1/builders/list", get(builders_list))
        .route("/api/v1/builders/status", get(builders_status))
        .route("/api/v1/heartbeat", post(heartbeat))
        .route("/api/v1/gpg/public-key", get(gpg_public_key))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn packages_query(State(_state): State<AppState>, Json(_req): Json<PackageQueryRequest>) -> Json<PackageQueryResponse> {
    // The binary-package cache is an external collaborator (§1); no
    // cache backend is wired in by default, so every probe misses.
    Json(PackageQueryResponse { found: false, package: None })
}

async fn packages_request_build(State(state): State<AppState>, Json(body): Json<RequestBuildBody>) -> Result<(StatusCode, Json<AcceptedJobResponse>), ApiError> {
    let request = body.into_job_request();
    let (job_id, poll) = state.dispatcher.accept(request).await.map_err(ApiError::from)?;
    if let Some(poll) = poll {
        tokio::spawn(poll);
    }
    Ok((StatusCode::ACCEPTED, Json(AcceptedJobResponse::queued(job_id))))
}

#[derive(Debug, Deserialize)]
struct JobIdQuery {
    job_id: String,
}

async fn packages_status(State(state): State<AppState>, Query(q): Query<JobIdQuery>) -> Result<Json<buildfarm_core::job::JobRecord>, ApiError> {
    state
        .jobs
        .read()
        .get(&q.job_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::from(CoreError::NotFound(q.job_id)))
}

async fn builds_list(State(state): State<AppState>, Query(q): Query<BuildsListQuery>) -> Json<Vec<buildfarm_core::job::JobRecord>> {
    let mut jobs = state.local_jobs_newest_first();
    jobs.truncate(q.effective_limit());
    Json(jobs)
}

async fn builds_logs(State(state): State<AppState>, Query(q): Query<JobIdQuery>) -> Result<String, ApiError> {
    state
        .jobs
        .read()
        .get(&q.job_id)
        .map(|j| j.result.log.clone())
        .ok_or_else(|| ApiError::from(CoreError::NotFound(q.job_id)))
}

async fn cluster_status(State(state): State<AppState>) -> Json<buildfarm_core::registry::RegistryStats> {
    Json(state.registry.stats())
}

async fn builders_register(State(state): State<AppState>, Json(req): Json<BuilderRegisterRequest>) -> Json<SuccessResponse> {
    state.registry.register(req.builder_id, req.endpoint, req.architecture, req.capacity);
    Json(SuccessResponse::ok())
}

async fn builders_list(State(state): State<AppState>) -> Json<Vec<buildfarm_core::registry::BuilderRecord>> {
    Json(state.registry.list())
}

async fn builders_status(State(state): State<AppState>) -> Json<Vec<buildfarm_core::protocol::FleetBuilderStatus>> {
    Json(state.dispatcher.fleet_status().await)
}

async fn heartbeat(State(state): State<AppState>, Json(payload): Json<HeartbeatPayload>) -> Result<Json<SuccessResponse>, ApiError> {
    if payload.builder_id.trim().is_empty() {
        return Err(ApiError::from(CoreError::Validation("builder_id is required".into())));
    }
    state.registry.heartbeat(&payload.builder_id, payload.status, &payload.endpoint, payload.capacity, payload.resources);
    state.metrics.heartbeats_total.inc();
    Ok(Json(SuccessResponse::ok()))
}

async fn gpg_public_key(State(state): State<AppState>) -> Result<Vec<u8>, (StatusCode, Json<buildfarm_core::protocol::GpgKeyUnavailable>)> {
    if !state.config.gpg_enabled {
        return Err((StatusCode::NOT_FOUND, Json(buildfarm_core::protocol::GpgKeyUnavailable { error: "signing disabled".into() })));
    }
    let Some(path) = &state.config.gpg_public_key_path else {
        return Err((StatusCode::NOT_FOUND, Json(buildfarm_core::protocol::GpgKeyUnavailable { error: "no public key configured".into() })));
    };
    tokio::fs::read(path)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, Json(buildfarm_core::protocol::GpgKeyUnavailable { error: e.to_string() })))
}

/// Runs the coordinator's background maintenance: builder stale-sweep
/// and job-retention cleanup, on their own tickers (§9's "coroutine/
/// async control flow" note: cancellable periodic tasks).
pub async fn run_maintenance_loop(state: AppState) {
    let heartbeat_timeout = Duration::from_secs(state.config.heartbeat_timeout_seconds);
    let retention = chrono::Duration::hours(state.config.job_retention_hours);
    let mut ticker = tokio::time::interval(Duration::from_secs(15));
    loop {
        ticker.tick().await;
        let decayed = state.registry.sweep_stale(heartbeat_timeout);
        if !decayed.is_empty() {
            tracing::info!(count = decayed.len(), "builders decayed to offline");
        }
        let mut jobs = state.jobs.write();
        let dropped = buildfarm_core::store::JobStore::clean_old(&mut jobs, retention, chrono::Utc::now());
        drop(jobs);
        if dropped > 0 {
            tracing::info!(dropped, "evicted old terminal jobs");
            state.persist();
        }
    }
}
