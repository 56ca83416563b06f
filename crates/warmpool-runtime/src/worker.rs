//! Worker and factory traits: the seam between the pool and whatever
//! engine it keeps warm.
//!
//! The pool never inspects a worker beyond these four calls, so tests use
//! in-memory workers and the daemon uses [`crate::process::ProcessWorker`].

use crate::error::PoolResult;

/// One pooled engine instance.
///
/// Handles are shared as `Arc<W>` between the set that currently owns the
/// worker and the caller holding its lease, hence `&self` receivers.
/// `kill` and `close` must tolerate being called on a worker that is
/// already terminated.
pub trait Worker: Send + Sync + 'static {
    /// Called exactly once per lease, before the worker reaches the caller.
    fn activate(&self);

    /// Hard terminate. Used for stale idle workers and pool teardown.
    fn kill(&self);

    /// Soft terminate. Used for leases that were never released.
    fn close(&self);

    /// Whether the worker has outlived its idle or lease budget at `now_ms`
    /// (milliseconds since the Unix epoch).
    fn is_overdue(&self, now_ms: u64) -> bool;
}

/// Creates new workers on demand.
///
/// `create` is synchronous and may block for the whole startup of the
/// engine; the pool runs it on a blocking thread.
pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: Worker;

    fn create(&self) -> PoolResult<Self::Worker>;
}
