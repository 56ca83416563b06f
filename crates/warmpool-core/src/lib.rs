//! warmpool-core: configuration and shared helpers for the worker pool.
//!
//! The pool itself lives in `warmpool-runtime`; this crate only knows how
//! to turn a `warmpool.toml` file into validated [`PoolConfig`] and
//! [`ProcessConfig`] values.

pub mod config;
pub mod error;
pub mod time;

pub use config::{PoolConfig, ProcessConfig, WarmpoolConfig, parse_duration};
pub use error::{ConfigError, ConfigResult};
pub use time::now_millis;
