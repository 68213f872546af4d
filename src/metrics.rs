use std::time::Duration;

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::warn;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

pub struct Metrics {
    pub handle: PrometheusHandle,
}

fn describe() {
    describe_counter!("risk_requests_total", "Analysis requests received, by kind");
    describe_counter!(
        "risk_decisions_total",
        "Completed analyses, by kind, tier and action"
    );
    describe_counter!(
        "risk_rate_limited_total",
        "Requests rejected by the rate limiter, by endpoint"
    );
    describe_counter!("lookup_cache_hits_total", "Enrichment cache hits, by lookup");
    describe_counter!("lookup_cache_misses_total", "Enrichment cache misses, by lookup");
    describe_counter!(
        "lookup_degraded_total",
        "Enrichment lookups that failed or timed out, by lookup"
    );
    describe_counter!(
        "history_write_failures_total",
        "Analysis records that could not be persisted"
    );
    describe_counter!("otp_issued_total", "Step-up codes issued");
    describe_counter!(
        "otp_verifications_total",
        "Step-up code checks, by outcome"
    );
    describe_histogram!(
        "risk_pipeline_duration_ms",
        Unit::Milliseconds,
        "End-to-end analysis latency"
    );
    describe_gauge!(
        "lookup_cache_ttl_secs",
        Unit::Seconds,
        "Positive TTL of enrichment cache entries"
    );
}

impl Metrics {
    /// Install the Prometheus recorder once per process and publish the cache
    /// TTL. Later calls reuse the installed handle.
    pub fn init(cache_ttl: Duration) -> Self {
        let handle = HANDLE
            .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => {
                    describe();
                    handle
                }
                Err(e) => {
                    // Another recorder owns the process; render an empty registry.
                    warn!(error = %e, "prometheus recorder not installed");
                    PrometheusBuilder::new().build_recorder().handle()
                }
            })
            .clone();

        gauge!("lookup_cache_ttl_secs").set(cache_ttl.as_secs_f64());

        Self { handle }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
