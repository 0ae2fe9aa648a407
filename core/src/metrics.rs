// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Ambient metrics registry.
//!
//! §9 recasts the "global mutable state" singleton metrics registry as
//! an explicit object constructed once and passed into components;
//! global publication (a `/metrics` endpoint) is a configuration
//! choice made by the binary crates, not something this type does on
//! its own.

use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Process-wide counters and gauges for one coordinator or builder
/// instance. Not a singleton: constructed once at startup and threaded
/// through application state via `Arc`.
pub struct MetricsRegistry {
    registry: Registry,
    /// Jobs accepted, labeled by outcome once terminal (`success`/`failed`).
    pub jobs_total: IntCounterVec,
    /// Jobs currently in-flight (queued through building).
    pub jobs_in_flight: IntGauge,
    /// Cumulative count of cache probe hits.
    pub cache_hits_total: IntCounter,
    /// Cumulative count of cache probe misses.
    pub cache_misses_total: IntCounter,
    /// Cumulative count of heartbeats received (coordinator) or sent (builder).
    pub heartbeats_total: IntCounter,
    /// Process uptime in seconds, updated by the caller on an interval.
    pub uptime_seconds: Gauge,
}

impl MetricsRegistry {
    /// Construct a fresh registry with all metrics registered under it.
    /// Panics only if two metrics are registered under the same name,
    /// which would indicate a programming error in this constructor.
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("buildfarm_jobs_total", "Total jobs by terminal outcome"),
            &["outcome"],
        )
        .expect("valid metric definition");
        let jobs_in_flight = IntGauge::new("buildfarm_jobs_in_flight", "Jobs not yet in a terminal state").expect("valid metric definition");
        let cache_hits_total = IntCounter::new("buildfarm_cache_hits_total", "Cache probes that found an artifact").expect("valid metric definition");
        let cache_misses_total = IntCounter::new("buildfarm_cache_misses_total", "Cache probes that found nothing").expect("valid metric definition");
        let heartbeats_total = IntCounter::new("buildfarm_heartbeats_total", "Heartbeats processed").expect("valid metric definition");
        let uptime_seconds = Gauge::new("buildfarm_uptime_seconds", "Process uptime in seconds").expect("valid metric definition");

        registry.register(Box::new(jobs_total.clone())).expect("register jobs_total");
        registry.register(Box::new(jobs_in_flight.clone())).expect("register jobs_in_flight");
        registry.register(Box::new(cache_hits_total.clone())).expect("register cache_hits_total");
        registry.register(Box::new(cache_misses_total.clone())).expect("register cache_misses_total");
        registry.register(Box::new(heartbeats_total.clone())).expect("register heartbeats_total");
        registry.register(Box::new(uptime_seconds.clone())).expect("register uptime_seconds");

        Self { registry, jobs_total, jobs_in_flight, cache_hits_total, cache_misses_total, heartbeats_total, uptime_seconds }
    }

    /// Render the current metric values in Prometheus text exposition
    /// format, for a `/metrics` endpoint.
    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buf).expect("prometheus text encoding");
        String::from_utf8(buf).expect("prometheus text encoder produces valid utf8")
    }

    /// Record a job reaching a terminal state.
    pub fn record_job_terminal(&self, success: bool) {
        self.jobs_total.with_label_values(&[if success { "success" } else { "failed" }]).inc();
        self.jobs_in_flight.dec();
    }

    /// Record a job entering a non-terminal in-flight state.
    pub fn record_job_started(&self) {
        self.jobs_in_flight.inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metric_names() {
        let metrics = MetricsRegistry::new();
        metrics.record_job_started();
        metrics.record_job_terminal(true);
        let text = metrics.render();
        assert!(text.contains("buildfarm_jobs_total"));
        assert!(text.contains("buildfarm_jobs_in_flight"));
    }

    #[test]
    fn job_lifecycle_updates_counters() {
        let metrics = MetricsRegistry::new();
        metrics.record_job_started();
        assert_eq!(metrics.jobs_in_flight.get(), 1);
        metrics.record_job_terminal(false);
        assert_eq!(metrics.jobs_in_flight.get(), 0);
        assert_eq!(metrics.jobs_total.with_label_values(&["failed"]).get(), 1);
    }
}
