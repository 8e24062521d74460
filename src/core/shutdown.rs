//! Shutdown Coordination
//!
//! Tracks the engine lifecycle (`constructed → running → draining → stopped`)
//! and broadcasts shutdown requests to the dispatch loop. The first request
//! starts a graceful drain; a forced request abandons the drain.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Lifecycle state of a consumer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Constructed,
    Running,
    Draining,
    Stopped,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Constructed,
            1 => EngineState::Running,
            2 => EngineState::Draining,
            _ => EngineState::Stopped,
        }
    }
}

/// Signal delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Stop pulling new work and wait for in-flight work
    Graceful,
    /// Stop waiting for in-flight work
    Forced,
}

/// Coordinates graceful shutdown of one engine
#[derive(Debug)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    state: AtomicU8,
    forced: AtomicBool,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator and its first subscription
    pub fn new() -> (Self, broadcast::Receiver<ShutdownSignal>) {
        // Use a larger channel to avoid dropping bursts of shutdown signals
        let (shutdown_tx, shutdown_rx) = broadcast::channel(8);

        let coordinator = Self {
            shutdown_tx,
            state: AtomicU8::new(EngineState::Constructed as u8),
            forced: AtomicBool::new(false),
        };

        (coordinator, shutdown_rx)
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `constructed → running`; false if shutdown was already requested
    pub fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(
                EngineState::Constructed as u8,
                EngineState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn mark_stopped(&self) {
        self.state
            .store(EngineState::Stopped as u8, Ordering::Release);
    }

    /// Request a graceful drain
    ///
    /// Non-blocking and idempotent: only the call that moves the engine into
    /// `draining` broadcasts, and the return value tells whether it was this one.
    pub fn request_shutdown(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match EngineState::from_u8(current) {
                EngineState::Constructed | EngineState::Running => {}
                EngineState::Draining | EngineState::Stopped => return false,
            }
            match self.state.compare_exchange_weak(
                current,
                EngineState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let _ = self.shutdown_tx.send(ShutdownSignal::Graceful);
        true
    }

    /// Abandon the drain; implies a shutdown request
    pub fn force_shutdown(&self) {
        self.request_shutdown();
        if !self.forced.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown_tx.send(ShutdownSignal::Forced);
        }
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        matches!(
            self.state(),
            EngineState::Draining | EngineState::Stopped
        )
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    /// Route OS termination signals into this coordinator
    ///
    /// The first signal requests a graceful drain, any further signal forces it.
    /// Must be called from within a tokio runtime.
    pub fn install_signal_handlers(self: &Arc<Self>) {
        setup_signal_handlers(self.clone());
    }
}

fn on_signal(coordinator: &ShutdownCoordinator, previous_signals: usize) {
    if previous_signals == 0 {
        log::info!("Shutdown signal received; draining in-flight messages");
        coordinator.request_shutdown();
    } else {
        log::warn!("Second shutdown signal received; abandoning drain");
        coordinator.force_shutdown();
    }
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    #[cfg(unix)]
    {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }

        use std::sync::atomic::AtomicUsize;
        use tokio::signal::unix::{signal, SignalKind};
        let signal_count = Arc::new(AtomicUsize::new(0));
        let signals = [
            SignalKind::interrupt(),
            SignalKind::terminate(),
            SignalKind::hangup(),
            SignalKind::quit(),
        ];

        for kind in signals {
            let coordinator = coordinator.clone();
            let sig_ctr = signal_count.clone();

            tokio::spawn(async move {
                if let Ok(mut sig) = signal(kind) {
                    while sig.recv().await.is_some() {
                        let prev = sig_ctr.fetch_add(1, Ordering::AcqRel);
                        on_signal(&coordinator, prev);
                        if coordinator.is_forced() {
                            break;
                        }
                    }
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let mut count = 0;
            while tokio::signal::ctrl_c().await.is_ok() {
                on_signal(&coordinator, count);
                count += 1;
                if coordinator.is_forced() {
                    break;
                }
            }
        });
    }
}
