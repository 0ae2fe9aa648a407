// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Builder registry (C5): a thread-safe map of builder identity to
//! capability/health, with stale-entry decay.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CapacityError;
use crate::job::BuilderId;

/// Liveness/enablement status surfaced to the fleet-status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuilderStatus {
    /// Heartbeating within the timeout window and not disabled.
    Online,
    /// Online and currently running at least one job.
    Busy,
    /// Last heartbeat older than the configured timeout, or explicitly
    /// reported offline.
    Offline,
}

/// Resource utilization reported by a builder's heartbeat, as
/// percentages in `[0.0, 100.0]`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// CPU utilization percentage.
    pub cpu_percent: f64,
    /// Memory utilization percentage.
    pub mem_percent: f64,
    /// Disk utilization percentage.
    pub disk_percent: f64,
}

/// A builder's identity, capability, and current health as known to
/// the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderRecord {
    /// Stable identity, chosen by the builder at registration.
    pub id: BuilderId,
    /// HTTP base URL the coordinator dispatches to.
    pub endpoint: String,
    /// Declared target architecture.
    pub architecture: String,
    /// Maximum concurrent jobs.
    pub capacity: u32,
    /// Jobs currently assigned and building.
    pub current_load: u32,
    /// Administrative enable flag; a disabled builder is never selected.
    pub enabled: bool,
    /// Liveness as last observed; forced to `Offline` by the cleanup
    /// sweep once `last_heartbeat` exceeds the configured timeout.
    pub status: BuilderStatus,
    /// Timestamp of the most recent register-or-heartbeat call.
    pub last_heartbeat: DateTime<Utc>,
    /// Most recently reported resource metrics.
    pub resources: ResourceMetrics,
    /// Lifetime count of jobs dispatched to this builder.
    pub total_jobs: u64,
    /// Lifetime count of jobs that completed successfully.
    pub success_jobs: u64,
    /// Lifetime count of jobs that failed.
    pub failed_jobs: u64,
}

impl BuilderRecord {
    /// True if healthy (status not `Offline`), enabled, and under capacity.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.enabled && self.status != BuilderStatus::Offline && self.current_load < self.capacity
    }
}

/// Fleet-wide aggregate counters returned by `/api/v1/cluster/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Count of builders currently online or busy.
    pub online: usize,
    /// Count of builders currently offline.
    pub offline: usize,
    /// Sum of capacity across all known builders.
    pub total_capacity: u64,
    /// Sum of current load across all known builders.
    pub total_load: u64,
    /// Lifetime jobs dispatched across the fleet.
    pub total_jobs: u64,
    /// Lifetime successful jobs across the fleet.
    pub success_jobs: u64,
    /// Lifetime failed jobs across the fleet.
    pub failed_jobs: u64,
    /// `success_jobs / total_jobs`, or `0.0` if no jobs have completed.
    pub success_ratio: f64,
}

/// Thread-safe builder registry. Register-or-update merges new fields
/// over the existing record, if any. Records are never deleted by the
/// decay sweep -- only an explicit `unregister` removes an entry.
pub struct BuilderRegistry {
    builders: Arc<DashMap<BuilderId, BuilderRecord>>,
}

impl BuilderRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { builders: Arc::new(DashMap::new()) }
    }

    /// Register a new builder, or update an existing one's declared
    /// capability fields. `last_heartbeat` is always reset to now.
    pub fn register(&self, id: BuilderId, endpoint: String, architecture: String, capacity: u32) {
        self.builders
            .entry(id.clone())
            .and_modify(|b| {
                b.endpoint = endpoint.clone();
                b.architecture = architecture.clone();
                b.capacity = capacity;
                b.last_heartbeat = Utc::now();
                b.status = BuilderStatus::Online;
                b.enabled = true;
            })
            .or_insert_with(|| BuilderRecord {
                id,
                endpoint,
                architecture,
                capacity,
                current_load: 0,
                enabled: true,
                status: BuilderStatus::Online,
                last_heartbeat: Utc::now(),
                resources: ResourceMetrics::default(),
                total_jobs: 0,
                success_jobs: 0,
                failed_jobs: 0,
            });
    }

    /// Apply a heartbeat: register-or-update, mirroring [`Self::register`]
    /// for a builder seen for the first time via a heartbeat rather than
    /// an explicit `/builders/register` call (a builder record is created
    /// on first registration *or* first heartbeat). Status, resources,
    /// and `last_heartbeat` are always refreshed; `current_load` is left
    /// untouched on an existing record -- it is authoritative state the
    /// coordinator itself maintains via [`Self::try_reserve_load`]/
    /// [`Self::decr_load`], not something the builder's self-reported
    /// active-job count is allowed to overwrite.
    pub fn heartbeat(&self, id: &str, status: BuilderStatus, endpoint: &str, capacity: u32, resources: ResourceMetrics) {
        self.builders
            .entry(id.to_string())
            .and_modify(|b| {
                b.status = status;
                b.resources = resources;
                b.last_heartbeat = Utc::now();
            })
            .or_insert_with(|| {
                info!(builder_id = id, "builder joined the fleet via heartbeat, no prior registration");
                BuilderRecord {
                    id: id.to_string(),
                    endpoint: endpoint.to_string(),
                    architecture: "unknown".into(),
                    capacity,
                    current_load: 0,
                    enabled: true,
                    status,
                    last_heartbeat: Utc::now(),
                    resources,
                    total_jobs: 0,
                    success_jobs: 0,
                    failed_jobs: 0,
                }
            });
    }

    /// Explicitly remove a builder. The only way a record is ever deleted.
    pub fn unregister(&self, id: &str) -> Option<BuilderRecord> {
        self.builders.remove(id).map(|(_, b)| b)
    }

    /// Snapshot a single builder record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<BuilderRecord> {
        self.builders.get(id).map(|b| b.clone())
    }

    /// Snapshot every known builder record.
    #[must_use]
    pub fn list(&self) -> Vec<BuilderRecord> {
        self.builders.iter().map(|b| b.value().clone()).collect()
    }

    /// Set the administrative enable flag only.
    pub fn set_enabled(&self, id: &str, enabled: bool) {
        if let Some(mut b) = self.builders.get_mut(id) {
            b.enabled = enabled;
        }
    }

    /// Update liveness only, leaving capability fields untouched.
    pub fn set_health(&self, id: &str, healthy: bool) {
        if let Some(mut b) = self.builders.get_mut(id) {
            b.status = if healthy { BuilderStatus::Online } else { BuilderStatus::Offline };
        }
    }

    /// Atomically check eligibility (known, enabled, not offline, under
    /// capacity) and reserve a load slot in the same critical section,
    /// in that check order. `get_mut` holds the `DashMap` shard lock for
    /// this entry for the whole check-then-increment, so two concurrent
    /// callers for the same builder id cannot both observe room under
    /// capacity and both reserve -- unlike a separate `get` followed by
    /// a later `incr_load`, which leaves a gap wide enough for
    /// `current_load` to exceed `capacity`. Does not touch `total_jobs`;
    /// call [`Self::record_dispatch`] once the reservation is actually
    /// used, or [`Self::release_load`] to give it back unused.
    pub fn try_reserve_load(&self, id: &str) -> Result<(), CapacityError> {
        let mut b = self.builders.get_mut(id).ok_or_else(|| CapacityError::UnknownBuilder(id.to_string()))?;
        if !b.enabled {
            return Err(CapacityError::BuilderDisabled(id.to_string()));
        }
        if b.status == BuilderStatus::Offline {
            return Err(CapacityError::BuilderUnhealthy(id.to_string()));
        }
        if b.current_load >= b.capacity {
            return Err(CapacityError::BuilderAtCapacity(id.to_string()));
        }
        b.current_load += 1;
        Ok(())
    }

    /// Give back a load slot reserved by [`Self::try_reserve_load`] that
    /// was never actually dispatched (e.g. the global parallelism cap
    /// was hit, or the queue emptied out from under the caller).
    pub fn release_load(&self, id: &str) {
        if let Some(mut b) = self.builders.get_mut(id) {
            b.current_load = b.current_load.saturating_sub(1);
        }
    }

    /// Record that a reserved load slot turned into an actual dispatch,
    /// for the lifetime `total_jobs` counter.
    pub fn record_dispatch(&self, id: &str) {
        if let Some(mut b) = self.builders.get_mut(id) {
            b.total_jobs += 1;
        }
    }

    /// Decrement `current_load` by one and record the outcome, used when
    /// a job owned by this builder reaches a terminal state.
    pub fn decr_load(&self, id: &str, success: bool) {
        if let Some(mut b) = self.builders.get_mut(id) {
            b.current_load = b.current_load.saturating_sub(1);
            if success {
                b.success_jobs += 1;
            } else {
                b.failed_jobs += 1;
            }
        }
    }

    /// Force to `Offline` every builder whose `last_heartbeat` is older
    /// than `timeout`. Returns the ids forced offline by this call. The
    /// record is kept -- this never deletes.
    pub fn sweep_stale(&self, timeout: StdDuration) -> Vec<BuilderId> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let mut decayed = Vec::new();
        for mut entry in self.builders.iter_mut() {
            if entry.status != BuilderStatus::Offline && entry.last_heartbeat < cutoff {
                entry.status = BuilderStatus::Offline;
                decayed.push(entry.id.clone());
            }
        }
        if !decayed.is_empty() {
            info!(count = decayed.len(), "builders decayed to offline on heartbeat timeout");
        }
        decayed
    }

    /// Fleet-wide aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for b in self.builders.iter() {
            match b.status {
                BuilderStatus::Offline => stats.offline += 1,
                BuilderStatus::Online | BuilderStatus::Busy => stats.online += 1,
            }
            stats.total_capacity += u64::from(b.capacity);
            stats.total_load += u64::from(b.current_load);
            stats.total_jobs += b.total_jobs;
            stats.success_jobs += b.success_jobs;
            stats.failed_jobs += b.failed_jobs;
        }
        stats.success_ratio = if stats.total_jobs > 0 {
            stats.success_jobs as f64 / stats.total_jobs as f64
        } else {
            0.0
        };
        stats
    }
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_heartbeat_updates_status_not_load() {
        let reg = BuilderRegistry::new();
        reg.register("b1".into(), "http://b1".into(), "amd64".into(), 2);
        reg.try_reserve_load("b1").unwrap();
        reg.heartbeat("b1", BuilderStatus::Busy, "http://b1", 2, ResourceMetrics::default());

        let rec = reg.get("b1").unwrap();
        assert_eq!(rec.status, BuilderStatus::Busy);
        // current_load is coordinator-authoritative; a heartbeat never
        // overwrites it from the builder's self-report.
        assert_eq!(rec.current_load, 1);
    }

    #[test]
    fn heartbeat_from_unknown_builder_creates_a_record() {
        let reg = BuilderRegistry::new();
        reg.heartbeat("b2", BuilderStatus::Online, "http://b2", 4, ResourceMetrics::default());

        let rec = reg.get("b2").unwrap();
        assert_eq!(rec.endpoint, "http://b2");
        assert_eq!(rec.capacity, 4);
        assert_eq!(rec.current_load, 0);
    }

    #[test]
    fn try_reserve_load_refuses_once_at_capacity() {
        let reg = BuilderRegistry::new();
        reg.register("b1".into(), "http://b1".into(), "amd64".into(), 1);
        reg.try_reserve_load("b1").unwrap();
        let err = reg.try_reserve_load("b1").unwrap_err();
        assert_eq!(err, CapacityError::BuilderAtCapacity("b1".into()));
        assert_eq!(reg.get("b1").unwrap().current_load, 1);
    }

    #[test]
    fn release_load_gives_back_an_unused_reservation() {
        let reg = BuilderRegistry::new();
        reg.register("b1".into(), "http://b1".into(), "amd64".into(), 1);
        reg.try_reserve_load("b1").unwrap();
        reg.release_load("b1");
        assert_eq!(reg.get("b1").unwrap().current_load, 0);
        assert_eq!(reg.get("b1").unwrap().total_jobs, 0);
    }

    #[test]
    fn sweep_stale_marks_offline_but_keeps_record() {
        let reg = BuilderRegistry::new();
        reg.register("b1".into(), "http://b1".into(), "amd64".into(), 2);
        if let Some(mut b) = reg.builders.get_mut("b1") {
            b.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        }

        let decayed = reg.sweep_stale(StdDuration::from_secs(60));
        assert_eq!(decayed, vec!["b1".to_string()]);
        assert!(reg.get("b1").is_some());
        assert_eq!(reg.get("b1").unwrap().status, BuilderStatus::Offline);
    }

    #[test]
    fn unregister_is_the_only_deletion_path() {
        let reg = BuilderRegistry::new();
        reg.register("b1".into(), "http://b1".into(), "amd64".into(), 2);
        reg.set_health("b1", false);
        assert!(reg.get("b1").is_some());
        reg.unregister("b1");
        assert!(reg.get("b1").is_none());
    }

    #[test]
    fn stats_aggregate_across_fleet() {
        let reg = BuilderRegistry::new();
        reg.register("b1".into(), "http://b1".into(), "amd64".into(), 4);
        reg.register("b2".into(), "http://b2".into(), "amd64".into(), 4);
        reg.try_reserve_load("b1").unwrap();
        reg.record_dispatch("b1");
        reg.decr_load("b1", true);
        reg.try_reserve_load("b2").unwrap();
        reg.record_dispatch("b2");
        reg.decr_load("b2", false);

        let stats = reg.stats();
        assert_eq!(stats.online, 2);
        assert_eq!(stats.total_capacity, 8);
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.success_jobs, 1);
        assert_eq!(stats.failed_jobs, 1);
        assert!((stats.success_ratio - 0.5).abs() < f64::EPSILON);
    }
}
