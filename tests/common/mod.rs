//! Common test utilities and helpers

use mqworker::broker::api::{EngineResult, EngineStats, ShutdownCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Request a graceful shutdown and collect the engine's final counters
pub async fn shutdown_and_join(
    shutdown: &Arc<ShutdownCoordinator>,
    running: JoinHandle<EngineResult<EngineStats>>,
) -> EngineStats {
    shutdown.request_shutdown();
    timeout(Duration::from_secs(5), running)
        .await
        .expect("engine should stop in time")
        .expect("engine task should not panic")
        .expect("engine should stop cleanly")
}
