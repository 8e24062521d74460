//! Consumer statistics

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Counters shared between the dispatch loop and processing tasks
#[derive(Debug, Default)]
pub struct ConsumerStatistics {
    dispatched: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    panicked: AtomicUsize,
    acked: AtomicUsize,
    nacked: AtomicUsize,
    settle_errors: AtomicUsize,
    rejected_on_shutdown: AtomicUsize,
    completion: Notify,
}

impl ConsumerStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.completion.notify_waiters();
    }

    /// Count a failed invocation; panics count as failures too
    pub fn record_failed(&self, panicked: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if panicked {
            self.panicked.fetch_add(1, Ordering::Relaxed);
        }
        self.completion.notify_waiters();
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nacked(&self) {
        self.nacked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_settle_error(&self) {
        self.settle_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_on_shutdown(&self) {
        self.rejected_on_shutdown.fetch_add(1, Ordering::Relaxed);
    }

    /// Handler invocations that have completed, successfully or not
    pub fn finished(&self) -> usize {
        self.succeeded.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }

    pub fn in_progress(&self) -> usize {
        self.dispatched
            .load(Ordering::Relaxed)
            .saturating_sub(self.finished())
    }

    /// Wait until at least `count` invocations have finished
    pub async fn wait_finished(&self, count: usize) {
        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not lost
            notified.as_mut().enable();
            if self.finished() >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            settle_errors: self.settle_errors.load(Ordering::Relaxed),
            rejected_on_shutdown: self.rejected_on_shutdown.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub panicked: usize,
    pub acked: usize,
    pub nacked: usize,
    pub settle_errors: usize,
    pub rejected_on_shutdown: usize,
}
