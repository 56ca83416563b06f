//! Estimation arithmetic: pure functions from window contents to a
//! target pool size.
//!
//! ```text
//! startup_time_ms = mean(startup window)                  (truncating)
//! demand_per_ms   = len(request window) / (now - oldest + 1)
//! target          = clamp(demand_per_ms * safety * elapsed_ms, min, max)
//! ```
//!
//! Nothing here is incremental: every tick recomputes from the windows.

use serde::Serialize;

/// Demand assumed before the first maintenance tick (requests per ms).
pub const INITIAL_DEMAND_PER_MS: f64 = 0.001;

/// The pool's current view of startup latency and request rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimates {
    pub startup_time_ms: u64,
    pub demand_per_ms: f64,
}

impl Estimates {
    pub fn initial(startup_time_ms: u64) -> Self {
        Self {
            startup_time_ms,
            demand_per_ms: INITIAL_DEMAND_PER_MS,
        }
    }

    /// Demand scaled to requests per second.
    pub fn demand_hz(&self) -> f64 {
        self.demand_per_ms * 1000.0
    }
}

/// Integer mean of the startup-time samples; 0 for an empty slice.
pub fn mean_startup_time(samples: &[u64]) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    samples.iter().sum::<u64>() / samples.len() as u64
}

/// Requests per millisecond over the span from the oldest sample to `now_ms`.
///
/// The `+ 1` keeps a window whose samples all landed this millisecond finite.
pub fn demand_rate(request_times: &[u64], now_ms: u64) -> f64 {
    let Some(&oldest) = request_times.first() else {
        return 0.0;
    };
    request_times.len() as f64 / (now_ms.saturating_sub(oldest) as f64 + 1.0)
}

/// Number of workers the pool should hold (ready plus starting).
pub fn target_size(
    demand_per_ms: f64,
    safety_multiplier: f64,
    elapsed_ms: u64,
    pool_min: usize,
    pool_max: usize,
) -> f64 {
    let estimate = demand_per_ms * safety_multiplier * elapsed_ms as f64;
    estimate.max(pool_min as f64).min(pool_max as f64)
}
