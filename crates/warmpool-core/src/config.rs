//! warmpool.toml configuration parser.
//!
//! The file is read into loosely-typed sections (every pool knob optional,
//! durations as strings) and then resolved into the immutable
//! [`PoolConfig`] / [`ProcessConfig`] values the runtime consumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Deserialize)]
pub struct WarmpoolConfig {
    #[serde(default)]
    pub pool: PoolSection,
    pub process: ProcessSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolSection {
    pub startup_limit: Option<usize>,
    pub update_cycle: Option<String>,
    pub average_count: Option<usize>,
    pub safety_multiplier: Option<f64>,
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub startup_time_initial_estimate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessSection {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub ready_marker: Option<String>,
    pub idle_timeout: Option<String>,
    pub lease_timeout: Option<String>,
    pub startup_timeout: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

impl WarmpoolConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve the `[pool]` table, filling defaults and validating.
    pub fn pool_config(&self) -> ConfigResult<PoolConfig> {
        let defaults = PoolConfig::default();
        let section = &self.pool;

        let config = PoolConfig {
            startup_limit: section.startup_limit.unwrap_or(defaults.startup_limit),
            update_cycle: optional_duration("pool.update_cycle", &section.update_cycle)?
                .unwrap_or(defaults.update_cycle),
            average_count: section.average_count.unwrap_or(defaults.average_count),
            safety_multiplier: section
                .safety_multiplier
                .unwrap_or(defaults.safety_multiplier),
            pool_min: section.min.unwrap_or(defaults.pool_min),
            pool_max: section.max.unwrap_or(defaults.pool_max),
            startup_time_initial_estimate: optional_duration(
                "pool.startup_time_initial_estimate",
                &section.startup_time_initial_estimate,
            )?
            .unwrap_or(defaults.startup_time_initial_estimate),
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve the `[process]` table, filling defaults and validating.
    pub fn process_config(&self) -> ConfigResult<ProcessConfig> {
        let section = &self.process;
        let mut config = ProcessConfig::from_command_line(&section.command);

        config.working_dir = section.working_dir.clone();
        config.ready_marker = section.ready_marker.clone();
        config.env = section.env.clone().unwrap_or_default();
        if let Some(idle) = optional_duration("process.idle_timeout", &section.idle_timeout)? {
            config.idle_timeout = idle;
        }
        if let Some(lease) = optional_duration("process.lease_timeout", &section.lease_timeout)? {
            config.lease_timeout = lease;
        }
        if let Some(startup) =
            optional_duration("process.startup_timeout", &section.startup_timeout)?
        {
            config.startup_timeout = startup;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Pool sizing and throttling policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of workers starting concurrently.
    pub startup_limit: usize,
    /// Period of the maintenance cycle.
    pub update_cycle: Duration,
    /// Capacity of the startup-time and request history windows.
    pub average_count: usize,
    /// Multiplier applied to the demand estimate when sizing the pool.
    pub safety_multiplier: f64,
    pub pool_min: usize,
    pub pool_max: usize,
    /// Seed for the startup-time window before any worker has started.
    pub startup_time_initial_estimate: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            startup_limit: 2,
            update_cycle: Duration::from_millis(500),
            average_count: 5,
            safety_multiplier: 3.0,
            pool_min: 1,
            pool_max: 10,
            startup_time_initial_estimate: Duration::from_millis(2000),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.startup_limit == 0 {
            return Err(invalid("pool.startup_limit", "must be at least 1"));
        }
        if self.average_count == 0 {
            return Err(invalid("pool.average_count", "must be at least 1"));
        }
        if self.update_cycle.is_zero() {
            return Err(invalid("pool.update_cycle", "must be non-zero"));
        }
        if !self.safety_multiplier.is_finite() || self.safety_multiplier <= 0.0 {
            return Err(invalid(
                "pool.safety_multiplier",
                "must be a positive finite number",
            ));
        }
        if self.pool_min > self.pool_max {
            return Err(invalid(
                "pool.min",
                format!("min ({}) exceeds max ({})", self.pool_min, self.pool_max),
            ));
        }
        Ok(())
    }
}

/// How to launch one worker process, and when it counts as overdue.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Line fragment the worker prints on stdout once it is ready.
    pub ready_marker: Option<String>,
    /// A ready worker older than this is evicted.
    pub idle_timeout: Duration,
    /// A leased worker activated longer ago than this is reclaimed.
    pub lease_timeout: Duration,
    /// How long construction waits for the ready marker before giving up.
    pub startup_timeout: Duration,
}

impl ProcessConfig {
    /// Build a config from a whitespace-separated command line.
    pub fn from_command_line(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
            working_dir: None,
            env: HashMap::new(),
            ready_marker: None,
            idle_timeout: Duration::from_secs(600),
            lease_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(60),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.program.is_empty() {
            return Err(invalid("process.command", "must not be empty"));
        }
        if self.idle_timeout.is_zero() {
            return Err(invalid("process.idle_timeout", "must be non-zero"));
        }
        if self.lease_timeout.is_zero() {
            return Err(invalid("process.lease_timeout", "must be non-zero"));
        }
        if self.startup_timeout.is_zero() {
            return Err(invalid("process.startup_timeout", "must be non-zero"));
        }
        Ok(())
    }
}

/// Parse a duration such as `"250ms"`, `"30s"`, `"5m"` or `"1h"`.
///
/// A bare integer is read as milliseconds.
pub fn parse_duration(field: &'static str, value: &str) -> ConfigResult<Duration> {
    let s = value.trim();
    let (number, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s, 1)
    };

    let bad = || ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    };
    let n: u64 = number.trim().parse().map_err(|_| bad())?;
    n.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(bad)
}

fn optional_duration(
    field: &'static str,
    value: &Option<String>,
) -> ConfigResult<Option<Duration>> {
    value.as_deref().map(|v| parse_duration(field, v)).transpose()
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
