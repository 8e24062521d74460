//! Admission gates
//!
//! An [`AdmissionGate`] bounds how many handler invocations may run at once for
//! one queue. Permits are owned values: whoever holds the [`GatePermit`] holds a
//! slot, and the slot is returned when the permit is dropped, including when the
//! holding task panics or is aborted.

use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Capacity-bounded concurrency limiter scoped to one queue
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    name: String,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    global: Option<Arc<Semaphore>>,
}

impl AdmissionGate {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            global: None,
        }
    }

    /// Additionally draw every permit from a ceiling shared across queues
    pub fn with_global_limit(mut self, global: Arc<Semaphore>) -> Self {
        self.global = Some(global);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of permits currently held
    pub fn held(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Wait until a slot is free; fails only once the gate has been closed
    pub async fn acquire(&self) -> Result<GatePermit, AcquireError> {
        self.reserve().await?.admit().await
    }

    /// Take this queue's slot without drawing from the shared ceiling yet
    ///
    /// Sources reserve before pulling a message and admit after one arrived,
    /// so idle queues never sit on shared capacity.
    pub async fn reserve(&self) -> Result<Reservation, AcquireError> {
        let queue = self.semaphore.clone().acquire_owned().await?;
        Ok(Reservation {
            queue,
            global: self.global.clone(),
        })
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<GatePermit> {
        let queue = self.semaphore.clone().try_acquire_owned().ok()?;
        let global = match &self.global {
            Some(global) => Some(global.clone().try_acquire_owned().ok()?),
            None => None,
        };
        Some(GatePermit {
            _queue: queue,
            _global: global,
        })
    }

    /// Refuse further acquisitions; outstanding permits stay valid
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// A queue slot that still needs the shared ceiling
#[derive(Debug)]
pub struct Reservation {
    queue: OwnedSemaphorePermit,
    global: Option<Arc<Semaphore>>,
}

impl Reservation {
    pub async fn admit(self) -> Result<GatePermit, AcquireError> {
        let global = match self.global {
            Some(global) => Some(global.acquire_owned().await?),
            None => None,
        };
        Ok(GatePermit {
            _queue: self.queue,
            _global: global,
        })
    }
}

/// One admitted slot; released on drop
#[derive(Debug)]
pub struct GatePermit {
    _queue: OwnedSemaphorePermit,
    _global: Option<OwnedSemaphorePermit>,
}
