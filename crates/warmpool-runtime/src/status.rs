//! Point-in-time report of the pool, for logs and operator tooling.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    /// Spawns currently holding a throttle permit.
    pub starting: usize,
    pub ready: usize,
    pub leased: usize,
    /// Request rate estimate in requests per second.
    pub demand_hz: f64,
    pub startup_time_ms: u64,
}

impl PoolStatus {
    /// Label/value pairs in their fixed reporting order.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Workers starting up", self.starting.to_string()),
            ("Ready workers in the pool", self.ready.to_string()),
            ("Workers in use", self.leased.to_string()),
            ("Current demand estimate", format!("{} Hz", self.demand_hz)),
            ("Current startup time", format!("{} ms", self.startup_time_ms)),
        ]
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, value) in self.entries() {
            writeln!(f, "{label}: {value}")?;
        }
        Ok(())
    }
}
