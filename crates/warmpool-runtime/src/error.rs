//! Runtime error types.

use thiserror::Error;

/// Errors that can occur while creating or leasing workers.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to launch worker `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited before printing ready marker {marker:?}")]
    StartupExited { marker: String },

    #[error("worker did not print ready marker {marker:?} within {timeout_ms} ms")]
    StartupTimeout { marker: String, timeout_ms: u64 },

    #[error("failed to read worker output: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker pool is shut down")]
    Closed,
}

pub type PoolResult<T> = Result<T, PoolError>;
