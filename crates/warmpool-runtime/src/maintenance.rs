//! Maintenance driver: background task that periodically runs the pool's
//! maintenance cycle.
//!
//! The task holds only a `Weak` reference to its target, so a dropped pool
//! ends the loop on the next tick even if nobody called `stop()`.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Something with a periodic upkeep step.
pub trait Maintainable: Send + Sync + 'static {
    /// Run one cycle. `elapsed` is the time since the previous cycle.
    fn do_maintenance(self: Arc<Self>, elapsed: Duration) -> impl Future<Output = ()> + Send;
}

/// Handle to a running maintenance loop.
pub struct MaintenanceDriver {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl MaintenanceDriver {
    /// Spawn the loop on the current tokio runtime.
    pub fn start<M: Maintainable>(target: Weak<M>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_maintenance_loop(target, interval, shutdown_rx));
        info!(interval_ms = interval.as_millis() as u64, "maintenance driver started");
        Self {
            handle,
            shutdown_tx,
        }
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait for it to exit. A cycle already in progress
    /// runs to completion; no cycle starts after this returns.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            error!(error = %e, "maintenance task panicked");
        }
        info!("maintenance driver stopped");
    }
}

async fn run_maintenance_loop<M: Maintainable>(
    target: Weak<M>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_cycle = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("maintenance loop shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                let Some(target) = target.upgrade() else {
                    debug!("maintenance target dropped");
                    break;
                };
                let now = Instant::now();
                let elapsed = now.duration_since(last_cycle);
                last_cycle = now;
                target.do_maintenance(elapsed).await;
            }
        }
    }
}
