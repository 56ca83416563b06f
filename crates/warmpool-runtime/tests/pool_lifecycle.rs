//! Integration tests for the worker pool lifecycle.
//!
//! These drive the public `WorkerPool` API with an in-memory factory:
//! - lease on an empty pool, FIFO order, distinct owners
//! - startup throttle bound and spawn-failure recovery
//! - replenishment through the maintenance driver
//! - overdue lease reclamation, release and shutdown idempotence

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warmpool_core::{PoolConfig, now_millis};
use warmpool_runtime::{PoolError, PoolResult, Worker, WorkerFactory, WorkerPool};

// ── Mock worker and factory ─────────────────────────────────────────

#[derive(Default)]
struct Probe {
    activations: AtomicUsize,
    kills: AtomicUsize,
    closes: AtomicUsize,
}

struct MockWorker {
    serial: usize,
    activated_at: AtomicU64,
    lease_limit_ms: u64,
    probe: Arc<Probe>,
}

impl Worker for MockWorker {
    fn activate(&self) {
        self.probe.activations.fetch_add(1, Ordering::SeqCst);
        self.activated_at.store(now_millis(), Ordering::SeqCst);
    }

    fn kill(&self) {
        self.probe.kills.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_overdue(&self, now_ms: u64) -> bool {
        match self.activated_at.load(Ordering::SeqCst) {
            0 => false,
            at => now_ms >= at + self.lease_limit_ms,
        }
    }
}

struct FactoryState {
    created: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    failing: AtomicBool,
    delay: Duration,
    lease_limit_ms: u64,
    probes: Mutex<Vec<Arc<Probe>>>,
}

impl FactoryState {
    fn new(delay: Duration) -> Arc<Self> {
        Self::with_lease_limit(delay, 60_000)
    }

    fn with_lease_limit(delay: Duration, lease_limit_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay,
            lease_limit_ms,
            probes: Mutex::new(Vec::new()),
        })
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn probes(&self) -> Vec<Arc<Probe>> {
        self.probes.lock().unwrap().clone()
    }
}

struct MockFactory(Arc<FactoryState>);

impl WorkerFactory for MockFactory {
    type Worker = MockWorker;

    fn create(&self) -> PoolResult<MockWorker> {
        let state = &self.0;
        if state.failing.load(Ordering::SeqCst) {
            return Err(PoolError::Io(std::io::Error::other("engine failed to boot")));
        }

        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(state.delay);
        state.active.fetch_sub(1, Ordering::SeqCst);

        let probe = Arc::new(Probe::default());
        state.probes.lock().unwrap().push(Arc::clone(&probe));
        Ok(MockWorker {
            serial: state.created.fetch_add(1, Ordering::SeqCst),
            activated_at: AtomicU64::new(0),
            lease_limit_ms: state.lease_limit_ms,
            probe,
        })
    }
}

fn config(startup_limit: usize, pool_min: usize, pool_max: usize) -> PoolConfig {
    PoolConfig {
        startup_limit,
        pool_min,
        pool_max,
        update_cycle: Duration::from_millis(10),
        ..PoolConfig::default()
    }
}

/// Poll a condition until it holds, failing the test after five seconds.
macro_rules! wait_for {
    ($what:expr, $cond:expr) => {{
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !$cond {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", $what);
    }};
}

// ── Lease protocol ──────────────────────────────────────────────────

#[tokio::test]
async fn lease_on_empty_pool_waits_for_one_spawn() {
    let state = FactoryState::new(Duration::from_millis(30));
    let pool = WorkerPool::new(MockFactory(Arc::clone(&state)), config(2, 1, 10));

    let lease = pool.lease().await.unwrap();
    assert_eq!(state.created(), 1);
    assert_eq!(lease.serial, 0);
    assert_eq!(lease.probe.activations.load(Ordering::SeqCst), 1);

    let status = pool.status().await;
    assert_eq!(status.leased, 1);
    assert_eq!(status.ready, 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn leases_follow_spawn_order() {
    let state = FactoryState::new(Duration::ZERO);
    let pool = WorkerPool::new(MockFactory(Arc::clone(&state)), config(1, 0, 10));

    for expected in 1..=3 {
        assert_eq!(pool.replenish_to(f64::INFINITY).await, 1);
        wait_for!("spawn to finish", {
            let status = pool.status().await;
            status.starting == 0 && status.ready == expected
        });
    }

    let mut serials = Vec::new();
    for _ in 0..3 {
        serials.push(pool.lease().await.unwrap().serial);
    }
    assert_eq!(serials, vec![0, 1, 2]);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_leases_get_distinct_workers() {
    let state = FactoryState::new(Duration::from_millis(5));
    let pool = WorkerPool::start(MockFactory(Arc::clone(&state)), config(4, 0, 32));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move { pool.lease().await.unwrap() }));
    }

    let mut serials = HashSet::new();
    let mut leases = Vec::new();
    for task in tasks {
        let lease = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("lease timed out")
            .unwrap();
        assert!(serials.insert(lease.serial), "worker {} leased twice", lease.serial);
        leases.push(lease);
    }

    assert_eq!(pool.status().await.leased, 16);
    for lease in &leases {
        assert_eq!(lease.probe.activations.load(Ordering::SeqCst), 1);
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn release_is_idempotent() {
    let state = FactoryState::new(Duration::ZERO);
    let pool = WorkerPool::new(MockFactory(state), config(2, 0, 10));

    let lease = pool.lease().await.unwrap();
    assert!(pool.release(&lease).await);
    assert!(!pool.release(&lease).await);
    assert_eq!(pool.status().await.leased, 0);

    pool.shutdown().await;
}

// ── Startup throttle ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_spawns_never_exceed_startup_limit() {
    let state = FactoryState::new(Duration::from_millis(20));
    let pool = WorkerPool::new(MockFactory(Arc::clone(&state)), config(2, 0, 10));

    wait_for!("eight workers", {
        pool.replenish_to(8.0).await;
        state.created() >= 8
    });

    assert!(state.max_active.load(Ordering::SeqCst) <= 2);
    assert!(pool.status().await.starting <= 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn failed_spawn_returns_its_permit() {
    let state = FactoryState::new(Duration::ZERO);
    state.failing.store(true, Ordering::SeqCst);
    let pool = WorkerPool::new(MockFactory(Arc::clone(&state)), config(1, 0, 10));

    for _ in 0..3 {
        assert_eq!(pool.replenish_to(1.0).await, 1);
        wait_for!("failed spawn to release permit", {
            pool.status().await.starting == 0
        });
    }
    assert_eq!(state.created(), 0);
    assert_eq!(pool.status().await.ready, 0);

    // Once the engine boots again the pool recovers.
    state.failing.store(false, Ordering::SeqCst);
    assert_eq!(pool.replenish_to(1.0).await, 1);
    wait_for!("recovered worker", { pool.status().await.ready == 1 });

    pool.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn silent_engine_does_not_pin_its_startup_slot() {
    let mut process = warmpool_core::ProcessConfig::from_command_line("sh");
    process.args = vec!["-c".to_string(), "exec sleep 30".to_string()];
    process.ready_marker = Some("READY".to_string());
    process.startup_timeout = Duration::from_millis(200);
    let pool = WorkerPool::new(warmpool_runtime::ProcessFactory::new(process), config(1, 0, 10));

    assert_eq!(pool.replenish_to(1.0).await, 1);
    wait_for!("timed-out spawn to release its permit", {
        pool.status().await.starting == 0
    });
    // The slot is free for the next attempt.
    assert_eq!(pool.replenish_to(1.0).await, 1);

    let stopped = tokio::time::timeout(Duration::from_secs(3), pool.shutdown()).await;
    assert!(stopped.is_ok(), "shutdown waited on a silent engine");
}

// ── Maintenance ─────────────────────────────────────────────────────

#[tokio::test]
async fn maintenance_driver_converges_to_pool_min() {
    let state = FactoryState::new(Duration::from_millis(5));
    let pool = WorkerPool::start(MockFactory(Arc::clone(&state)), config(2, 2, 10));

    wait_for!("two ready workers", { pool.status().await.ready >= 2 });

    // Without further demand the pool stays at or above the floor.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(15)).await;
        let status = pool.status().await;
        assert!(status.ready + status.starting >= 2);
    }
    assert!(state.created() <= 10 + 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn overdue_lease_is_closed_by_maintenance() {
    let state = FactoryState::with_lease_limit(Duration::ZERO, 0);
    let pool = WorkerPool::new(MockFactory(Arc::clone(&state)), config(2, 0, 0));

    let lease = pool.lease().await.unwrap();
    let report = pool.do_maintenance(Duration::from_millis(10)).await;
    assert_eq!(report.leases_evicted, 1);
    assert_eq!(lease.probe.closes.load(Ordering::SeqCst), 1);
    assert_eq!(lease.probe.kills.load(Ordering::SeqCst), 0);

    // The caller finishing late is harmless.
    assert!(!pool.release(&lease).await);

    pool.shutdown().await;
}

#[tokio::test]
async fn status_starts_from_initial_estimates() {
    let state = FactoryState::new(Duration::ZERO);
    let pool = WorkerPool::new(MockFactory(state), config(2, 0, 10));

    let status = pool.status().await;
    assert_eq!(status.startup_time_ms, 2000);
    assert_eq!(status.demand_hz, 1.0);
    assert_eq!(status.ready, 0);
    assert_eq!(status.leased, 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn maintenance_records_startup_times() {
    let state = FactoryState::new(Duration::from_millis(20));
    let pool = WorkerPool::new(
        MockFactory(Arc::clone(&state)),
        PoolConfig {
            average_count: 1,
            ..config(1, 0, 0)
        },
    );

    assert_eq!(pool.replenish_to(1.0).await, 1);
    wait_for!("spawn", { pool.status().await.ready == 1 });
    pool.do_maintenance(Duration::from_millis(10)).await;

    let startup = pool.estimates().await.startup_time_ms;
    assert!(startup >= 20 && startup < 2000, "startup estimate {startup}");

    pool.shutdown().await;
}

#[tokio::test]
async fn make_worker_bypasses_the_pool() {
    let state = FactoryState::new(Duration::ZERO);
    let pool = WorkerPool::new(MockFactory(Arc::clone(&state)), config(2, 0, 10));

    let worker = pool.make_worker().unwrap();
    assert_eq!(worker.serial, 0);
    assert_eq!(pool.status().await.ready, 0);

    pool.shutdown().await;
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_is_idempotent_and_kills_everything() {
    let state = FactoryState::new(Duration::ZERO);
    let pool = WorkerPool::new(MockFactory(Arc::clone(&state)), config(2, 0, 10));

    pool.replenish_to(2.0).await;
    wait_for!("two ready workers", { pool.status().await.ready == 2 });
    let _lease = pool.lease().await.unwrap();

    pool.shutdown().await;
    pool.shutdown().await;
    assert!(pool.is_closed());

    let status = pool.status().await;
    assert_eq!(status.ready, 0);
    assert_eq!(status.leased, 0);

    let probes = state.probes();
    assert!(probes.len() >= 2);
    for probe in probes {
        assert_eq!(probe.kills.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn lease_after_shutdown_fails() {
    let state = FactoryState::new(Duration::ZERO);
    let pool = WorkerPool::new(MockFactory(state), config(2, 0, 10));
    pool.shutdown().await;

    assert!(matches!(pool.lease().await, Err(PoolError::Closed)));
}

#[tokio::test]
async fn shutdown_releases_blocked_lease() {
    let state = FactoryState::new(Duration::ZERO);
    state.failing.store(true, Ordering::SeqCst);
    let pool = WorkerPool::new(MockFactory(state), config(2, 0, 10));

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.lease().await.map(|lease| lease.serial) })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    pool.shutdown().await;
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
}

#[tokio::test]
async fn shutdown_stops_maintenance_driver() {
    let state = FactoryState::new(Duration::ZERO);
    let pool = WorkerPool::start(MockFactory(Arc::clone(&state)), config(2, 2, 10));
    wait_for!("initial workers", { state.created() >= 2 });

    pool.shutdown().await;
    let created = state.created();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.created(), created);
}
