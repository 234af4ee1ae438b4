//! Prometheus metrics for the light-client retrieval core.
//!
//! All metrics follow the naming convention: `light_<area>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., retrievals_total)
//! - **Gauge**: Value that can go up or down (e.g., peers_connected)
//! - **Histogram**: Distribution of values (e.g., retrieval_duration_seconds)
//!
//! Recording helpers are plain functions so callers never touch the statics
//! directly. Recording works whether or not [`register_metrics`] was called;
//! registration only makes the values visible to [`encode_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // RETRIEVAL METRICS
    // =========================================================================

    /// Logical retrievals by terminal outcome
    pub static ref RETRIEVALS: CounterVec = CounterVec::new(
        Opts::new("light_retrievals_total", "Logical retrievals by terminal outcome"),
        &["outcome"]  // outcome: validated/exhausted/canceled/timeout/stopped
    ).expect("metric creation failed");

    /// Dispatch attempts by result
    pub static ref RETRIEVAL_ATTEMPTS: CounterVec = CounterVec::new(
        Opts::new("light_retrieval_attempts_total", "Dispatch attempts by result"),
        &["result"]  // result: valid/invalid/timeout/peer_gone/send_failed
    ).expect("metric creation failed");

    /// Time from first dispatch to terminal outcome
    pub static ref RETRIEVAL_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "light_retrieval_duration_seconds",
            "Time from request creation to terminal outcome"
        ).buckets(exponential_buckets(0.005, 2.0, 14).expect("static bucket layout"))
    ).expect("metric creation failed");

    /// Logical retrievals currently pending
    pub static ref PENDING_REQUESTS: Gauge = Gauge::new(
        "light_pending_requests",
        "Logical retrievals currently pending"
    ).expect("metric creation failed");

    // =========================================================================
    // PEER METRICS
    // =========================================================================

    /// Connected peers
    pub static ref PEERS_CONNECTED: Gauge = Gauge::new(
        "light_peers_connected",
        "Number of currently connected server peers"
    ).expect("metric creation failed");

    /// Server record demotions (timeouts, bad data, dial failures)
    pub static ref SERVER_DEMOTIONS: IntCounter = IntCounter::new(
        "light_server_demotions_total",
        "Total server record demotions"
    ).expect("metric creation failed");

    // =========================================================================
    // RELAY METRICS
    // =========================================================================

    /// Transaction relay sends by result
    pub static ref RELAY_SENDS: CounterVec = CounterVec::new(
        Opts::new("light_relay_sends_total", "Transaction batches sent to peers"),
        &["result"]  // result: sent/failed
    ).expect("metric creation failed");
}

/// Handle proving metrics were registered.
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; metrics already registered are skipped.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(RETRIEVALS.clone()),
        Box::new(RETRIEVAL_ATTEMPTS.clone()),
        Box::new(RETRIEVAL_DURATION.clone()),
        Box::new(PENDING_REQUESTS.clone()),
        Box::new(PEERS_CONNECTED.clone()),
        Box::new(SERVER_DEMOTIONS.clone()),
        Box::new(RELAY_SENDS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Record the terminal outcome of a logical retrieval.
pub fn record_retrieval(outcome: &str, elapsed_secs: f64) {
    RETRIEVALS.with_label_values(&[outcome]).inc();
    RETRIEVAL_DURATION.observe(elapsed_secs);
}

/// Record the result of one dispatch attempt.
pub fn record_attempt(result: &str) {
    RETRIEVAL_ATTEMPTS.with_label_values(&[result]).inc();
}

/// Set the number of pending logical retrievals.
pub fn set_pending_requests(count: usize) {
    PENDING_REQUESTS.set(count as f64);
}

/// Set the number of connected peers.
pub fn set_peers_connected(count: usize) {
    PEERS_CONNECTED.set(count as f64);
}

/// Record one server record demotion.
pub fn record_server_demotion() {
    SERVER_DEMOTIONS.inc();
}

/// Record one relay send.
pub fn record_relay_send(result: &str) {
    RELAY_SENDS.with_label_values(&[result]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_twice() {
        assert!(register_metrics().is_ok());
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_attempt_counter_increments() {
        let before = RETRIEVAL_ATTEMPTS.with_label_values(&["timeout"]).get();
        record_attempt("timeout");
        assert!(RETRIEVAL_ATTEMPTS.with_label_values(&["timeout"]).get() >= before + 1.0);
    }

    #[test]
    fn test_encode_contains_registered_metric() {
        register_metrics().unwrap();
        record_relay_send("sent");
        let text = encode_metrics().unwrap();
        assert!(text.contains("light_relay_sends_total"));
    }
}
