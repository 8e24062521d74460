//! Shared helpers for engine tests

use crate::broker::api::{ConsumerEngine, EngineResult, EngineStats, HandlerGroup, MemoryTransport};
use crate::core::config::EngineConfig;
use crate::core::shutdown::ShutdownCoordinator;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

/// Tracks how many handler invocations overlap
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
    calls: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

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

pub async fn build_engine(
    transport: &MemoryTransport,
    config: EngineConfig,
    handlers: HandlerGroup,
) -> ConsumerEngine {
    ConsumerEngine::new("test-service", Arc::new(transport.clone()), config, handlers)
        .await
        .expect("engine setup should succeed")
}

/// Request a graceful shutdown and wait for the engine task to finish
pub async fn stop(
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
