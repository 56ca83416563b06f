//! StartupThrottle: bounds how many workers may be starting at once.
//!
//! A thin wrapper over a tokio `Semaphore` with `startup_limit` permits.
//! A spawn holds one permit from the moment it is scheduled until its
//! worker is enqueued or its construction fails.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct StartupThrottle {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl StartupThrottle {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Take a permit if one is free right now.
    ///
    /// Returns `None` when every permit is held or the throttle is closed.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    /// Free permits.
    pub fn available(&self) -> usize {
        if self.semaphore.is_closed() {
            0
        } else {
            self.semaphore.available_permits()
        }
    }

    /// Spawns currently holding a permit.
    pub fn in_progress(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }

    /// Refuse all further permits. Permits already held stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
