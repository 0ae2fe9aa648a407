// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared builder application state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use buildfarm_core::artifact::{ArtifactPipeline, ArtifactStore, Signer};
use buildfarm_core::config::BuilderConfig;
use buildfarm_core::executor::{BuildRunner, ExecutionMode, NativeRunner, SandboxExecutor, SandboxedRunner};
use buildfarm_core::heartbeat::HeartbeatSource;
use buildfarm_core::registry::{BuilderStatus, ResourceMetrics};
use buildfarm_core::store::JobStore;
use buildfarm_core::worker_pool::{JobTable, WorkerPool};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::build_executor::BuildJobExecutor;
use crate::runners::DockerCliDriver;
use crate::storage::{GpgSigner, HttpUploadStore};

/// Everything the builder's HTTP handlers and background tasks need.
#[derive(Clone)]
pub struct AppState {
    /// Process configuration, loaded once at startup.
    pub config: Arc<BuilderConfig>,
    /// Local job table (this builder's own jobs only; no fleet view).
    pub jobs: JobTable,
    /// Durable job-table persistence.
    pub store: Arc<JobStore>,
    /// Bounded worker pool draining submitted jobs.
    pub pool: Arc<WorkerPool>,
    /// Count of jobs currently building, maintained by the worker pool
    /// itself around each job's actual execution window and fed into
    /// heartbeat payloads and `/api/v1/status`.
    pub active_jobs: Arc<AtomicU32>,
}

impl AppState {
    /// Build the initial application state: restore any persisted job
    /// table, construct the sandbox executor for the configured mode,
    /// and spawn the worker pool.
    pub fn new(config: BuilderConfig) -> anyhow::Result<(Self, watch::Sender<bool>)> {
        let store = Arc::new(JobStore::new(&config.job_store_path)?);
        let loaded = store.load()?;
        let jobs: JobTable = Arc::new(RwLock::new(loaded));

        let runner: Box<dyn BuildRunner> = if config.sandboxed {
            let image = config
                .sandbox_image
                .clone()
                .ok_or_else(|| anyhow::anyhow!("sandboxed builder requires sandbox_image"))?;
            Box::new(SandboxedRunner::new(image, config.build_command.clone(), config.sandbox_config_mount.clone(), DockerCliDriver))
        } else {
            Box::new(NativeRunner { command: config.build_command.clone() })
        };
        let mode = if config.sandboxed { ExecutionMode::Sandboxed } else { ExecutionMode::Native };
        let sandbox = SandboxExecutor::new(runner, mode, Duration::from_secs(config.build_timeout_seconds), config.artifact_extension.clone());

        let http = reqwest::Client::builder().build()?;
        let signer: Option<Box<dyn Signer>> = if config.signing_enabled {
            let key_id = config.gpg_key_id.clone().ok_or_else(|| anyhow::anyhow!("signing_enabled requires gpg_key_id"))?;
            Some(Box::new(GpgSigner { key_id }))
        } else {
            None
        };
        let uploader: Option<Box<dyn ArtifactStore>> = if config.upload_enabled {
            let base_url = config.upload_base_url.clone().ok_or_else(|| anyhow::anyhow!("upload_enabled requires upload_base_url"))?;
            Some(Box::new(HttpUploadStore::new(http, base_url)))
        } else {
            None
        };
        let pipeline = ArtifactPipeline::new(config.artifact_dir.clone(), signer, uploader);

        let active_jobs = Arc::new(AtomicU32::new(0));
        let executor = Arc::new(BuildJobExecutor::new(sandbox, pipeline, config.artifact_dir.clone()));
        let pool = Arc::new(WorkerPool::spawn(
            config.workers,
            config.queue_capacity,
            config.builder_id.clone(),
            jobs.clone(),
            store.clone(),
            executor,
            active_jobs.clone(),
        ));

        let (stop_tx, _stop_rx) = watch::channel(false);

        Ok((Self { config: Arc::new(config), jobs, store, pool, active_jobs }, stop_tx))
    }

    /// Snapshot of every local job, newest first.
    pub fn local_jobs_newest_first(&self) -> Vec<buildfarm_core::job::JobRecord> {
        let mut jobs: Vec<_> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }

    /// Persist the job table, logging rather than propagating failure.
    pub fn persist(&self) {
        let snapshot: HashMap<_, _> = self.jobs.read().clone();
        if let Err(e) = self.store.save(&snapshot) {
            tracing::error!(error = %e, "failed to persist builder job table");
        }
    }

    /// Current busy/free status for heartbeat reporting.
    pub fn status(&self) -> BuilderStatus {
        if self.active_jobs.load(Ordering::SeqCst) >= self.config.capacity {
            BuilderStatus::Busy
        } else {
            BuilderStatus::Online
        }
    }

    /// Placeholder host resource metrics; real sampling is an external
    /// collaborator (§1).
    pub fn resources(&self) -> ResourceMetrics {
        ResourceMetrics::default()
    }
}

impl HeartbeatSource for AppState {
    fn active_jobs(&self) -> u32 {
        self.active_jobs.load(Ordering::SeqCst)
    }

    fn resources(&self) -> ResourceMetrics {
        AppState::resources(self)
    }

    fn status(&self) -> BuilderStatus {
        AppState::status(self)
    }
}
