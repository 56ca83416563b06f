//! LeasedSet: workers currently checked out, oldest lease first.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::worker::Worker;

/// Identifies one lease of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub(crate) u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

struct Entries<W> {
    leases: VecDeque<(LeaseId, Arc<W>)>,
    closed: bool,
}

pub struct LeasedSet<W> {
    entries: Mutex<Entries<W>>,
}

impl<W: Worker> LeasedSet<W> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                leases: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Record a lease. Hands the worker back if the set is closed.
    pub async fn insert(&self, id: LeaseId, worker: Arc<W>) -> Result<(), Arc<W>> {
        let mut entries = self.entries.lock().await;
        if entries.closed {
            return Err(worker);
        }
        entries.leases.push_back((id, worker));
        Ok(())
    }

    /// Forget a lease. Removing an absent lease is not an error.
    pub async fn remove(&self, id: LeaseId) -> Option<Arc<W>> {
        let mut entries = self.entries.lock().await;
        let index = entries.leases.iter().position(|(lease, _)| *lease == id)?;
        entries.leases.remove(index).map(|(_, worker)| worker)
    }

    /// Remove overdue leases from the oldest end, stopping at the first one
    /// that is still within budget.
    pub async fn evict_overdue(&self, now_ms: u64) -> Vec<(LeaseId, Arc<W>)> {
        let mut entries = self.entries.lock().await;
        let mut evicted = Vec::new();
        while entries
            .leases
            .front()
            .is_some_and(|(_, worker)| worker.is_overdue(now_ms))
        {
            evicted.extend(entries.leases.pop_front());
        }
        evicted
    }

    /// Number of outstanding leases.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.leases.len()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: LeaseId) -> bool {
        self.entries
            .lock()
            .await
            .leases
            .iter()
            .any(|(lease, _)| *lease == id)
    }

    /// Current workers, oldest lease first.
    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> Vec<Arc<W>> {
        self.entries
            .lock()
            .await
            .leases
            .iter()
            .map(|(_, worker)| Arc::clone(worker))
            .collect()
    }

    /// Refuse further inserts and hand back every recorded worker.
    pub async fn close(&self) -> Vec<Arc<W>> {
        let mut entries = self.entries.lock().await;
        entries.closed = true;
        entries.leases.drain(..).map(|(_, worker)| worker).collect()
    }
}

impl<W: Worker> Default for LeasedSet<W> {
    fn default() -> Self {
        Self::new()
    }
}
