//! ReadyQueue: started, unleased workers in creation order.
//!
//! Spawns append at the tail and leases take from the head, so age is
//! monotonic head → tail. Overdue eviction relies on that: it stops at the
//! first worker that is still within budget.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::worker::Worker;

/// Upper bound on one wait before a blocked taker re-checks the queue.
const WAIT_RECHECK: Duration = Duration::from_millis(50);

struct Slots<W> {
    workers: VecDeque<Arc<W>>,
    closed: bool,
}

pub struct ReadyQueue<W> {
    slots: Mutex<Slots<W>>,
    available: Notify,
}

impl<W: Worker> ReadyQueue<W> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                workers: VecDeque::new(),
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Append a worker at the tail. Hands the worker back if the queue is
    /// closed.
    pub async fn push(&self, worker: Arc<W>) -> Result<(), Arc<W>> {
        {
            let mut slots = self.slots.lock().await;
            if slots.closed {
                return Err(worker);
            }
            slots.workers.push_back(worker);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Wait until a worker is at the head and take it.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn take(&self) -> Option<Arc<W>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            {
                let mut slots = self.slots.lock().await;
                if slots.closed {
                    return None;
                }
                if let Some(worker) = slots.workers.pop_front() {
                    return Some(worker);
                }
            }

            let _ = tokio::time::timeout(WAIT_RECHECK, notified).await;
        }
    }

    /// Remove overdue workers from the head, stopping at the first one that
    /// is not overdue. Everything behind it is younger.
    pub async fn evict_overdue(&self, now_ms: u64) -> Vec<Arc<W>> {
        let mut slots = self.slots.lock().await;
        let mut evicted = Vec::new();
        while slots
            .workers
            .front()
            .is_some_and(|worker| worker.is_overdue(now_ms))
        {
            evicted.extend(slots.workers.pop_front());
        }
        evicted
    }

    /// Number of ready workers.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.workers.len()
    }

    /// Current contents, head first.
    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> Vec<Arc<W>> {
        self.slots.lock().await.workers.iter().cloned().collect()
    }

    /// Refuse further pushes, wake every blocked taker, and hand back the
    /// workers still queued.
    pub async fn close(&self) -> Vec<Arc<W>> {
        let drained = {
            let mut slots = self.slots.lock().await;
            slots.closed = true;
            slots.workers.drain(..).collect()
        };
        self.available.notify_waiters();
        drained
    }
}

impl<W: Worker> Default for ReadyQueue<W> {
    fn default() -> Self {
        Self::new()
    }
}
