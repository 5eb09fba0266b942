//! Prometheus metrics for the fd server
//!
//! All metrics live in the default registry; [`render`] dumps them in the
//! text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────────────────────

    /// Requests answered, by command and outcome.
    ///
    /// Labels:
    /// - command: "add", "get", "release" or "recover"
    /// - outcome: "ok" or the error kind (e.g. "bad_key", "backend")
    pub static ref FD_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "tapfd_requests_total",
        "Fd server requests by command and outcome",
        &["command", "outcome"]
    ).expect("failed to register FD_REQUESTS_TOTAL metric");

    /// Time spent in the dispatcher per request, fd source call included.
    pub static ref FD_DISPATCH_DURATION: HistogramVec = register_histogram_vec!(
        "tapfd_dispatch_duration_seconds",
        "Time spent dispatching a request to the fd source",
        &["command"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).expect("failed to register FD_DISPATCH_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Descriptors
    // ─────────────────────────────────────────────────────────────────────────────

    /// Keys currently tracked by the server.
    pub static ref FD_TRACKED_KEYS: Gauge = register_gauge!(
        "tapfd_tracked_keys",
        "Keys currently tracked by the fd server"
    ).expect("failed to register FD_TRACKED_KEYS metric");

    /// Descriptors passed to clients.
    pub static ref FD_DESCRIPTORS_SENT: Counter = register_counter!(
        "tapfd_descriptors_sent_total",
        "Descriptors sent to clients over SCM_RIGHTS"
    ).expect("failed to register FD_DESCRIPTORS_SENT metric");

    /// Connections dropped without a response.
    ///
    /// Labels:
    /// - stage: "accept", or the error kind that aborted the connection
    pub static ref FD_CONNECTION_ERRORS: CounterVec = register_counter_vec!(
        "tapfd_connection_errors_total",
        "Connections aborted before a response was sent",
        &["stage"]
    ).expect("failed to register FD_CONNECTION_ERRORS metric");
}

/// Encode every registered metric in the Prometheus text format
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_fd_metrics() {
        FD_REQUESTS_TOTAL.with_label_values(&["add", "ok"]).inc();
        FD_TRACKED_KEYS.set(3.0);

        let text = render();
        assert!(text.contains("tapfd_requests_total"));
        assert!(text.contains("tapfd_tracked_keys"));
    }
}
