//! Periodic worker health check.

use std::sync::Weak;
use std::time::Duration;

use tracing::debug;

use super::scheduler::EngineInner;

/// Reap stale workers every `interval` until the engine is dropped.
pub(crate) fn spawn_health_monitor(
    engine: Weak<EngineInner>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(engine) = engine.upgrade() else {
                break;
            };
            let reaped = engine.reap_stale_workers().await;
            if !reaped.is_empty() {
                debug!(count = reaped.len(), "Health check reaped workers");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stops_once_engine_is_dropped() {
        let handle = spawn_health_monitor(Weak::new(), Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor kept running")
            .unwrap();
    }
}
