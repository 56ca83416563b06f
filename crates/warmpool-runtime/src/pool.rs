//! Worker pool: keeps a demand-sized set of started workers ready to lease.
//!
//! Callers `lease()` a worker and `release()` it when done. Workers are
//! started in the background, at most `startup_limit` at a time, and a
//! periodic maintenance cycle evicts overdue workers and tops the pool up
//! to a size derived from recent demand.
//!
//! There is no global lock: the ready queue, leased set, history windows
//! and throttle are each synchronized on their own. Sizing reads them
//! without a joint snapshot; small miscounts correct on the next cycle.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use warmpool_core::{PoolConfig, now_millis};

use crate::error::{PoolError, PoolResult};
use crate::estimate::{Estimates, demand_rate, mean_startup_time, target_size};
use crate::history::HistoryWindow;
use crate::leased::{LeaseId, LeasedSet};
use crate::maintenance::{Maintainable, MaintenanceDriver};
use crate::ready::ReadyQueue;
use crate::status::PoolStatus;
use crate::throttle::StartupThrottle;
use crate::worker::{Worker, WorkerFactory};

/// A worker checked out of the pool.
pub struct Lease<W> {
    id: LeaseId,
    worker: Arc<W>,
}

impl<W> Lease<W> {
    /// Identifier of this lease, unique within the pool.
    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// Shared handle to the leased worker.
    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }
}

impl<W> Deref for Lease<W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.worker
    }
}

/// What one maintenance cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MaintenanceReport {
    /// Ready workers killed for sitting idle too long.
    pub idle_evicted: usize,
    /// Leased workers closed because they were never released.
    pub leases_evicted: usize,
    /// Pool size the estimates asked for.
    pub target: f64,
    /// Spawns scheduled to approach the target.
    pub spawned: usize,
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Kill,
    Close,
}

/// Cheaply cloneable handle to a shared worker pool.
pub struct WorkerPool<F: WorkerFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: WorkerFactory> Clone for WorkerPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<F: WorkerFactory> {
    factory: Arc<F>,
    config: PoolConfig,
    throttle: StartupThrottle,
    ready: ReadyQueue<F::Worker>,
    leased: LeasedSet<F::Worker>,
    /// Startup durations in ms.
    startup_history: HistoryWindow,
    /// Lease request times in ms since the epoch.
    request_history: HistoryWindow,
    estimates: Mutex<Estimates>,
    spawns: Mutex<JoinSet<()>>,
    next_lease: AtomicU64,
    closed: AtomicBool,
    driver: Mutex<Option<MaintenanceDriver>>,
}

impl<F: WorkerFactory> WorkerPool<F> {
    /// Create a pool without a maintenance driver. The caller is expected
    /// to invoke [`WorkerPool::do_maintenance`] itself.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self::build(factory, config, false)
    }

    /// Create a pool and start its maintenance driver at `update_cycle`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(factory: F, config: PoolConfig) -> Self {
        Self::build(factory, config, true)
    }

    fn build(factory: F, config: PoolConfig, with_driver: bool) -> Self {
        let initial_startup_ms = config.startup_time_initial_estimate.as_millis() as u64;
        info!(
            startup_limit = config.startup_limit,
            min = config.pool_min,
            max = config.pool_max,
            update_cycle_ms = config.update_cycle.as_millis() as u64,
            "worker pool starting"
        );

        let inner = Arc::new_cyclic(|weak| {
            let driver =
                with_driver.then(|| MaintenanceDriver::start(weak.clone(), config.update_cycle));
            PoolInner {
                factory: Arc::new(factory),
                throttle: StartupThrottle::new(config.startup_limit),
                ready: ReadyQueue::new(),
                leased: LeasedSet::new(),
                startup_history: HistoryWindow::seeded(config.average_count, initial_startup_ms),
                request_history: HistoryWindow::seeded(config.average_count, now_millis()),
                estimates: Mutex::new(Estimates::initial(initial_startup_ms)),
                spawns: Mutex::new(JoinSet::new()),
                next_lease: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                driver: Mutex::new(driver),
                config,
            }
        });
        Self { inner }
    }

    /// Sizing policy this pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a ready worker, waiting until one exists.
    ///
    /// Also starts one extra worker when a startup slot is free, so the
    /// pool refills while this caller waits. Fails only with
    /// [`PoolError::Closed`] once the pool is shut down. If every spawn
    /// keeps failing this waits forever.
    pub async fn lease(&self) -> PoolResult<Lease<F::Worker>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        inner.request_history.record(now_millis()).await;
        inner.try_spawn().await;

        let worker = inner.ready.take().await.ok_or(PoolError::Closed)?;
        let id = LeaseId(inner.next_lease.fetch_add(1, Ordering::Relaxed));
        // Activate first: anything in the leased set is judged by its lease
        // budget, never its idle one.
        worker.activate();
        if let Err(worker) = inner.leased.insert(id, Arc::clone(&worker)).await {
            terminate(vec![worker], Termination::Kill).await;
            return Err(PoolError::Closed);
        }

        debug!(lease = %id, "worker leased");
        Ok(Lease { id, worker })
    }

    /// Hand a lease back. Returns `false` if the lease was already gone,
    /// e.g. released twice or reclaimed as overdue.
    ///
    /// What happens to the worker afterwards is up to the caller.
    pub async fn release(&self, lease: &Lease<F::Worker>) -> bool {
        let released = self.inner.leased.remove(lease.id).await.is_some();
        debug!(lease = %lease.id, released, "lease released");
        released
    }

    /// Run one maintenance cycle: evict overdue ready workers, reclaim
    /// overdue leases, re-estimate and replenish.
    pub async fn do_maintenance(&self, elapsed: Duration) -> MaintenanceReport {
        self.inner.maintain(elapsed, now_millis()).await
    }

    /// Schedule spawns until ready plus starting workers reach `required`
    /// or no startup slot is free. Returns the number scheduled.
    pub async fn replenish_to(&self, required: f64) -> usize {
        self.inner.replenish_to(required).await
    }

    /// Build one worker on the calling thread without pooling it.
    pub fn make_worker(&self) -> PoolResult<F::Worker> {
        self.inner.factory.create()
    }

    /// Startup and demand estimates from the latest maintenance cycle.
    pub async fn estimates(&self) -> Estimates {
        *self.inner.estimates.lock().await
    }

    /// Snapshot of worker counts and current estimates.
    pub async fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        let estimates = *inner.estimates.lock().await;
        PoolStatus {
            starting: inner.throttle.in_progress(),
            ready: inner.ready.len().await,
            leased: inner.leased.len().await,
            demand_hz: estimates.demand_hz(),
            startup_time_ms: estimates.startup_time_ms,
        }
    }

    /// Whether [`WorkerPool::shutdown`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop maintenance, wait for in-flight spawns, and kill every worker
    /// in the pool, leased or not. Safe to call more than once.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let first = !inner.closed.swap(true, Ordering::AcqRel);

        let driver = inner.driver.lock().await.take();
        if let Some(driver) = driver {
            driver.stop().await;
        }

        inner.throttle.close();
        let ready = inner.ready.close().await;

        // A spawn may land in the set after we took it; loop until empty.
        loop {
            let mut spawns = std::mem::replace(&mut *inner.spawns.lock().await, JoinSet::new());
            if spawns.is_empty() {
                break;
            }
            while let Some(result) = spawns.join_next().await {
                if let Err(e) = result
                    && e.is_panic()
                {
                    error!(error = %e, "worker spawn task panicked");
                }
            }
        }

        let leased = inner.leased.close().await;
        let (ready_killed, leased_killed) = (ready.len(), leased.len());
        terminate(ready, Termination::Kill).await;
        terminate(leased, Termination::Kill).await;

        if first {
            info!(ready_killed, leased_killed, "worker pool shut down");
        }
    }
}

impl<F: WorkerFactory> PoolInner<F> {
    /// Start one spawn if a startup slot is free.
    async fn try_spawn(self: &Arc<Self>) -> bool {
        let Some(permit) = self.throttle.try_acquire() else {
            return false;
        };
        let inner = Arc::clone(self);
        let mut spawns = self.spawns.lock().await;
        while spawns.try_join_next().is_some() {}
        spawns.spawn(async move { inner.run_spawn(permit).await });
        true
    }

    /// Body of one spawn task. The permit is released when this returns.
    async fn run_spawn(&self, _permit: OwnedSemaphorePermit) {
        let started = Instant::now();
        let factory = Arc::clone(&self.factory);

        match tokio::task::spawn_blocking(move || factory.create()).await {
            Ok(Ok(worker)) => {
                let startup_ms = started.elapsed().as_millis() as u64;
                self.startup_history.record(startup_ms).await;
                match self.ready.push(Arc::new(worker)).await {
                    Ok(()) => debug!(startup_ms, "worker ready"),
                    Err(worker) => {
                        debug!("pool closed during startup, discarding worker");
                        terminate(vec![worker], Termination::Kill).await;
                    }
                }
            }
            Ok(Err(e)) => warn!(error = %e, "worker spawn failed"),
            Err(e) => error!(error = %e, "worker spawn task panicked"),
        }
    }

    async fn maintain(self: &Arc<Self>, elapsed: Duration, now_ms: u64) -> MaintenanceReport {
        if self.closed.load(Ordering::Acquire) {
            return MaintenanceReport::default();
        }

        let idle = self.ready.evict_overdue(now_ms).await;
        let idle_evicted = idle.len();
        terminate(idle, Termination::Kill).await;

        let overdue = self.leased.evict_overdue(now_ms).await;
        let leases_evicted = overdue.len();
        let mut abandoned = Vec::with_capacity(leases_evicted);
        for (id, worker) in overdue {
            debug!(lease = %id, "reclaiming overdue lease");
            abandoned.push(worker);
        }
        terminate(abandoned, Termination::Close).await;

        if idle_evicted + leases_evicted > 0 {
            info!(idle_evicted, leases_evicted, "evicted overdue workers");
        }

        let target = self.update_estimates(elapsed, now_ms).await;
        let spawned = self.replenish_to(target).await;
        debug!(target, spawned, "maintenance cycle complete");

        MaintenanceReport {
            idle_evicted,
            leases_evicted,
            target,
            spawned,
        }
    }

    /// Prune both windows, recompute the estimates from what is left, and
    /// return the target pool size.
    async fn update_estimates(&self, elapsed: Duration, now_ms: u64) -> f64 {
        let startup = self.startup_history.prune().await;
        let requests = self.request_history.prune().await;

        let estimates = Estimates {
            startup_time_ms: mean_startup_time(&startup),
            demand_per_ms: demand_rate(&requests, now_ms),
        };
        *self.estimates.lock().await = estimates;

        target_size(
            estimates.demand_per_ms,
            self.config.safety_multiplier,
            elapsed.as_millis() as u64,
            self.config.pool_min,
            self.config.pool_max,
        )
    }

    async fn replenish_to(self: &Arc<Self>, required: f64) -> usize {
        let mut in_flight = (self.ready.len().await + self.throttle.in_progress()) as f64;
        let mut spawned = 0;
        while in_flight < required && self.throttle.available() > 0 {
            if !self.try_spawn().await {
                break;
            }
            in_flight += 1.0;
            spawned += 1;
        }
        spawned
    }
}

impl<F: WorkerFactory> Maintainable for PoolInner<F> {
    async fn do_maintenance(self: Arc<Self>, elapsed: Duration) {
        self.maintain(elapsed, now_millis()).await;
    }
}

/// Terminate workers off the async threads; `kill`/`close` may block.
async fn terminate<W: Worker>(workers: Vec<Arc<W>>, how: Termination) {
    if workers.is_empty() {
        return;
    }
    let result = tokio::task::spawn_blocking(move || {
        for worker in &workers {
            match how {
                Termination::Kill => worker.kill(),
                Termination::Close => worker.close(),
            }
        }
    })
    .await;
    if let Err(e) = result {
        error!(error = %e, "worker termination panicked");
    }
}
