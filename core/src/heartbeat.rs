// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Heartbeat client (C9): a builder's periodic liveness report to its
//! coordinator.
//!
//! A failed heartbeat is a warning, not a fatal error -- the loop keeps
//! ticking on its own schedule regardless of whether the coordinator
//! accepted the last one (§4.8).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::registry::{BuilderStatus, ResourceMetrics};

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Wire body POSTed to the coordinator's `/api/v1/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// This builder's stable identity.
    pub builder_id: String,
    /// Self-reported liveness.
    pub status: BuilderStatus,
    /// HTTP base URL the coordinator should dispatch to.
    pub endpoint: String,
    /// Maximum concurrent jobs.
    pub capacity: u32,
    /// Jobs currently building.
    pub active_jobs: u32,
    /// Current resource utilization.
    pub resources: ResourceMetrics,
    /// Wall-clock time the payload was generated.
    pub timestamp: DateTime<Utc>,
}

/// Supplies the values a heartbeat payload needs at send time. Kept as
/// a trait so the builder's live job count and resource sampling can be
/// read from whatever in-process state owns them without the
/// heartbeat client depending on those types directly.
pub trait HeartbeatSource: Send + Sync {
    /// Number of jobs this builder is currently executing.
    fn active_jobs(&self) -> u32;
    /// Current resource utilization snapshot.
    fn resources(&self) -> ResourceMetrics;
    /// Self-reported status; `Busy` when `active_jobs() > 0`, `Online`
    /// otherwise, unless the source knows it is draining/unhealthy.
    fn status(&self) -> BuilderStatus;
}

/// Periodically POSTs a [`HeartbeatPayload`] to the coordinator until
/// told to stop.
pub struct HeartbeatClient {
    http: reqwest::Client,
    coordinator_url: String,
    builder_id: String,
    endpoint: String,
    capacity: u32,
    interval: Duration,
}

impl HeartbeatClient {
    /// Construct a client that will POST to
    /// `{coordinator_url}/api/v1/heartbeat` every `interval`.
    #[must_use]
    pub fn new(http: reqwest::Client, coordinator_url: String, builder_id: String, endpoint: String, capacity: u32, interval: Duration) -> Self {
        Self { http, coordinator_url, builder_id, endpoint, capacity, interval }
    }

    /// Run the heartbeat loop until `stop` is set to `true`. Checked
    /// cooperatively before each send and while sleeping between
    /// ticks, so shutdown is prompt without aborting a send mid-flight.
    pub async fn run(&self, source: &dyn HeartbeatSource, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *stop.borrow() {
                        break;
                    }
                    self.send_once(source).await;
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Send a single heartbeat. Any non-success response or transport
    /// error is logged and swallowed -- the caller's loop continues
    /// regardless.
    pub async fn send_once(&self, source: &dyn HeartbeatSource) {
        let payload = HeartbeatPayload {
            builder_id: self.builder_id.clone(),
            status: source.status(),
            endpoint: self.endpoint.clone(),
            capacity: self.capacity,
            active_jobs: source.active_jobs(),
            resources: source.resources(),
            timestamp: Utc::now(),
        };

        let url = format!("{}/api/v1/heartbeat", self.coordinator_url.trim_end_matches('/'));
        match self.http.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(status = %resp.status(), builder_id = %self.builder_id, "coordinator rejected heartbeat");
            }
            Err(e) => {
                warn!(error = %e, builder_id = %self.builder_id, "heartbeat send failed");
            }
        }
    }
}
