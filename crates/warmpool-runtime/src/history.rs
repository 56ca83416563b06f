//! Bounded sample windows feeding the pool estimates.
//!
//! Appends never trim; the maintenance cycle prunes the window back to its
//! capacity right before measuring it.

use std::collections::VecDeque;

use tokio::sync::Mutex;

#[derive(Debug)]
pub struct HistoryWindow {
    samples: Mutex<VecDeque<u64>>,
    capacity: usize,
}

impl HistoryWindow {
    /// Create a window holding a single seed sample, so it is never empty.
    pub fn seeded(capacity: usize, seed: u64) -> Self {
        let mut samples = VecDeque::with_capacity(capacity.max(1) + 1);
        samples.push_back(seed);
        Self {
            samples: Mutex::new(samples),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, sample: u64) {
        self.samples.lock().await.push_back(sample);
    }

    /// Drop the oldest samples until at most `capacity` remain, then return
    /// what is left (oldest first).
    pub async fn prune(&self) -> Vec<u64> {
        let mut samples = self.samples.lock().await;
        while samples.len() > self.capacity {
            samples.pop_front();
        }
        samples.iter().copied().collect()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.samples.lock().await.len()
    }
}
