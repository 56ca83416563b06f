//! warmpool-runtime: a warm pool of expensive-to-start workers.
//!
//! Keeps started workers ready so a lease does not pay full startup cost,
//! and sizes the pool from recent demand and observed startup latency:
//!
//! - **Startup throttle**: bounds how many workers start concurrently
//! - **Ready queue / leased set**: every worker lives in exactly one
//! - **History windows**: bounded samples of startup time and lease requests
//! - **Maintenance**: periodic overdue eviction, re-estimation, replenishment
//!
//! # Architecture
//!
//! ```text
//! WorkerPool
//!   ├── WorkerFactory (creates workers on a blocking thread)
//!   ├── StartupThrottle (Semaphore, startup_limit permits)
//!   ├── ReadyQueue (oldest first) ──lease()──▶ LeasedSet
//!   ├── HistoryWindow × 2 ──▶ Estimates ──▶ target size
//!   └── MaintenanceDriver (every update_cycle: evict, estimate, replenish)
//! ```

pub mod error;
pub mod estimate;
pub mod history;
pub mod leased;
pub mod maintenance;
pub mod pool;
pub mod process;
pub mod ready;
pub mod status;
pub mod throttle;
pub mod worker;

pub use error::{PoolError, PoolResult};
pub use estimate::Estimates;
pub use leased::LeaseId;
pub use pool::{Lease, MaintenanceReport, WorkerPool};
pub use process::{ProcessFactory, ProcessWorker, WorkerStdio};
pub use status::PoolStatus;
pub use worker::{Worker, WorkerFactory};
