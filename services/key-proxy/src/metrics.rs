//! Prometheus metrics exposition
//!
//! Service-level metrics recorded by the proxy:
//!
//! - `proxy_requests_total` (counter): labels `status`, `class`
//! - `proxy_request_duration_seconds` (histogram): labels `status`, `class`
//! - `proxy_upstream_errors_total` (counter): labels `class`, `error_type`
//!
//! The key pool records its own `key_pool_*` counters and gauges through the
//! same global recorder.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets from 5ms to 60s, matching the configurable timeout range.
/// Rotated requests can take several upstream round trips.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        metrics_exporter_prometheus::Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The handle's `render()` method produces the Prometheus text exposition format
/// suitable for serving on a `/metrics` endpoint.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed proxy request with status code and credential class labels.
pub fn record_request(status: u16, class: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "class" => class.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str, "class" => class.to_string())
        .record(duration_secs);
}

/// Record an upstream failure that reached the client.
pub fn record_upstream_error(class: &str, error_type: &str) {
    metrics::counter!(
        "proxy_upstream_errors_total",
        "class" => class.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        // When no recorder is installed, metrics calls are no-ops.
        record_request(200, "google", 0.05);
        record_upstream_error("google", "timeout");
    }

    /// Isolated recorder/handle pair; install_recorder() can only succeed once
    /// per process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder()
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "google", 0.042);
        record_request(503, "anam", 1.5);

        let output = handle.render();
        assert!(
            output.contains("proxy_requests_total"),
            "rendered output must contain proxy_requests_total counter"
        );
        assert!(output.contains("status=\"200\""), "counter must carry status label");
        assert!(output.contains("class=\"google\""), "counter must carry class label");
        assert!(output.contains("status=\"503\""));
        assert!(output.contains("class=\"anam\""));
        assert!(
            output.contains("proxy_request_duration_seconds_bucket"),
            "histogram must render _bucket lines for histogram_quantile() queries"
        );
    }

    #[test]
    fn record_upstream_error_increments_counter_with_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("google", "keys_exhausted");
        record_upstream_error("google", "timeout");

        let output = handle.render();
        assert!(output.contains("proxy_upstream_errors_total"));
        assert!(output.contains("error_type=\"keys_exhausted\""));
        assert!(output.contains("error_type=\"timeout\""));
    }

    #[test]
    fn histogram_buckets_cover_timeout_range() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "google", 0.003);

        let output = handle.render();
        assert!(output.contains("le=\"0.005\""), "5ms bucket must exist");
        assert!(output.contains("le=\"60\""), "60s bucket must exist");
        assert!(output.contains("le=\"+Inf\""), "+Inf bucket must exist");
    }
}
