// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared coordinator application state.

use std::collections::HashMap;
use std::sync::Arc;

use buildfarm_core::config::CoordinatorConfig;
use buildfarm_core::dispatch::{Dispatcher, FirstFit, NoCache};
use buildfarm_core::metrics::MetricsRegistry;
use buildfarm_core::registry::BuilderRegistry;
use buildfarm_core::store::JobStore;
use buildfarm_core::worker_pool::JobTable;
use parking_lot::RwLock;

/// Everything an HTTP handler needs, shared behind `Arc` across the
/// whole axum router.
#[derive(Clone)]
pub struct AppState {
    /// Process configuration, loaded once at startup.
    pub config: Arc<CoordinatorConfig>,
    /// Fleet registry of known builders.
    pub registry: Arc<BuilderRegistry>,
    /// Local authoritative job table.
    pub jobs: JobTable,
    /// Durable job-table persistence.
    pub store: Arc<JobStore>,
    /// Cache probe, builder selection, forwarding, and polling.
    pub dispatcher: Arc<Dispatcher>,
    /// Process-wide metrics.
    pub metrics: Arc<MetricsRegistry>,
}

impl AppState {
    /// Build the initial application state for one coordinator process,
    /// restoring any persisted job table and seeding the builder
    /// registry from configuration.
    pub fn new(config: CoordinatorConfig) -> anyhow::Result<Self> {
        let store = Arc::new(JobStore::new(&config.job_store_path)?);
        let loaded = store.load()?;
        let jobs: JobTable = Arc::new(RwLock::new(loaded));

        let registry = Arc::new(BuilderRegistry::new());
        for endpoint in &config.seed_builders {
            registry.register(endpoint.clone(), endpoint.clone(), "unknown".into(), 1);
        }

        let metrics = Arc::new(MetricsRegistry::new());

        let http = reqwest::Client::builder().build()?;
        let dispatcher = Arc::new(Dispatcher::new(
            http,
            registry.clone(),
            jobs.clone(),
            store.clone(),
            Arc::new(NoCache),
            Arc::new(FirstFit),
            metrics.clone(),
        ));

        Ok(Self { config: Arc::new(config), registry, jobs, store, dispatcher, metrics })
    }

    /// Snapshot of every local job, newest first.
    pub fn local_jobs_newest_first(&self) -> Vec<buildfarm_core::job::JobRecord> {
        let mut jobs: Vec<_> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }

    /// Persist the job table, logging rather than propagating failure
    /// (durability errors never block the hot path, per §7).
    pub fn persist(&self) {
        let snapshot: HashMap<_, _> = self.jobs.read().clone();
        if let Err(e) = self.store.save(&snapshot) {
            tracing::error!(error = %e, "failed to persist coordinator job table");
        }
    }
}
