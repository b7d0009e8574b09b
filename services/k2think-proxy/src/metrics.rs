//! Prometheus metrics exposition
//!
//! Proxy-level series recorded here:
//!
//! - `k2think_requests_total` (counter): labels `status`, `stream`
//! - `k2think_request_duration_seconds` (histogram): label `status`
//! - `k2think_upstream_attempts_total` (counter): label `outcome`
//!
//! The token-pool crate records `token_pool_*` series through the same
//! global recorder.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "k2think_request_duration_seconds";

/// Non-streaming replies wait for the full upstream answer, streaming ones
/// add up to the pacing budget on top, so buckets reach past a minute.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a finished chat request.
pub fn record_request(status: u16, stream: bool, duration_secs: f64) {
    let status_str = status.to_string();
    let stream = if stream { "true" } else { "false" };
    metrics::counter!("k2think_requests_total", "status" => status_str.clone(), "stream" => stream)
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Record one upstream attempt: `success`, `auth_error`, `timeout` or `error`.
pub fn record_attempt(outcome: &'static str) {
    metrics::counter!("k2think_upstream_attempts_total", "outcome" => outcome).increment(1);
}

/// In-process counters surfaced on `/health` and used for the shutdown drain.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Count a request as started; it stays in flight until the guard drops.
    pub fn begin(&self) -> InFlight {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight(self.in_flight.clone())
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InFlight(Arc<AtomicU64>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
