//! Periodic key pool status reporting
//!
//! Spawns a task that snapshots `get_status()` on an interval, publishes it as
//! gauges and warns about classes with no selectable key. Runs independently
//! of the request path; the pool itself never needs it to function.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::pool::KeyPool;

/// Spawn a background task that reports pool status every `interval`.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_status_task(pool: Arc<KeyPool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            report_cycle(&pool);
        }
    })
}

/// Publish one status snapshot.
fn report_cycle(pool: &KeyPool) {
    for (class, status) in pool.get_status() {
        metrics::gauge!("key_pool_keys_total", "class" => class.clone()).set(status.total as f64);
        metrics::gauge!("key_pool_keys_available", "class" => class.clone())
            .set(status.available as f64);
        metrics::gauge!("key_pool_keys_cooling_down", "class" => class.clone())
            .set(status.cooling_down as f64);

        if status.available == 0 {
            warn!(
                class = %class,
                total = status.total,
                cooling_down = status.cooling_down,
                "no keys available"
            );
        } else {
            debug!(
                class = %class,
                available = status.available,
                total = status.total,
                "key pool status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApiKey, CredentialClass};
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    fn test_pool() -> KeyPool {
        KeyPool::builder()
            .class(CredentialClass::google(), ["a", "b"])
            .class(CredentialClass::anam(), ["x"])
            .build()
            .unwrap()
    }

    #[test]
    fn report_cycle_publishes_gauges_per_class() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let pool = test_pool();
        pool.mark_exhausted("anam", &ApiKey::from("x"), "quota_error");
        report_cycle(&pool);

        let output = handle.render();
        assert!(
            output.contains("key_pool_keys_available{class=\"google\"} 2"),
            "google gauge missing, got:\n{output}"
        );
        assert!(
            output.contains("key_pool_keys_available{class=\"anam\"} 0"),
            "anam gauge missing, got:\n{output}"
        );
        assert!(
            output.contains("key_pool_keys_cooling_down{class=\"anam\"} 1"),
            "cooling gauge missing, got:\n{output}"
        );
    }

    #[test]
    fn report_cycle_without_recorder_does_not_panic() {
        report_cycle(&test_pool());
    }

    #[tokio::test]
    async fn spawned_task_runs_until_aborted() {
        let pool = Arc::new(test_pool());
        let handle = spawn_status_task(pool, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        handle.abort();
        let result = handle.await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
