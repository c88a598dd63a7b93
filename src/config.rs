//! Configuration for the memory pool bridge.
//!
//! Options are read once, when a manager or a pool is constructed. Nothing in
//! this crate watches for changes afterwards: in particular the spill threshold
//! of the default root pool is fixed for the lifetime of the process.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::Level;

pub const MIN_ALIGNMENT: u16 = 16;
pub const MAX_ALIGNMENT: u16 = 64;

pub const DEFAULT_SPILL_THRESHOLD: u64 = 512 * 1024 * 1024;

pub const ENV_ALIGNMENT: &str = "LIGHTNING_POOL_ALIGNMENT";
pub const ENV_THREAD_SAFE: &str = "LIGHTNING_POOL_THREAD_SAFE";
pub const ENV_TRACK_USAGE: &str = "LIGHTNING_POOL_TRACK_USAGE";
pub const ENV_CHECK_LEAK: &str = "LIGHTNING_POOL_CHECK_LEAK";
pub const ENV_CAPACITY: &str = "LIGHTNING_POOL_CAPACITY";
pub const ENV_SPILL_THRESHOLD: &str = "LIGHTNING_SPILL_THRESHOLD";
pub const ENV_LOG_LEVEL: &str = "LIGHTNING_LOG_LEVEL";
pub const ENV_LOG_JSON: &str = "LIGHTNING_LOG_JSON";
pub const ENV_LOG_ALLOCATIONS: &str = "LIGHTNING_LOG_ALLOCATIONS";

/// Per-pool options. Children copy these from their parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Alignment of direct byte allocations made through the pool.
    pub alignment: u16,
    /// Track peak usage and allocation counters. Reservations themselves are
    /// always tracked since capacity and spill checks depend on them.
    pub track_usage: bool,
    /// Serialize usage updates on this pool.
    pub thread_safe: bool,
    /// Treat a pool dropped with outstanding reservations as fatal.
    pub check_usage_leak: bool,
    /// Reservation limit. Only enforced on root pools.
    pub capacity: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            alignment: MIN_ALIGNMENT,
            track_usage: true,
            thread_safe: true,
            check_usage_leak: true,
            capacity: u64::MAX,
        }
    }
}

impl PoolOptions {
    pub fn validate(&self) -> Result<()> {
        validate_alignment(self.alignment)?;
        if self.capacity == 0 {
            return Err(Error::Config("pool capacity must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    pub alignment: u16,
    /// Upper bound on bytes the manager's native allocator may map.
    pub capacity: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            alignment: MIN_ALIGNMENT,
            capacity: u64::MAX,
        }
    }
}

/// Subscriber settings consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Level for this crate's events. `RUST_LOG` overrides it when set.
    pub level: String,
    pub json: bool,
    /// Also emit the per-allocation `trace!` events of the native allocator
    /// and the host adapter, whatever `level` says.
    pub allocation_trace: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            allocation_trace: false,
        }
    }
}

impl LoggingOptions {
    pub fn level(&self) -> Result<Level> {
        Level::from_str(self.level.trim())
            .map_err(|_| Error::Config(format!("invalid log level: {}", self.level)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub pool: PoolOptions,
    pub manager: ManagerOptions,
    /// Root reservation at or above which operators are asked to spill.
    pub spill_threshold: u64,
    pub logging: LoggingOptions,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pool: PoolOptions::default(),
            manager: ManagerOptions::default(),
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            logging: LoggingOptions::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Defaults overridden by any `LIGHTNING_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(alignment) = read_env::<u16>(ENV_ALIGNMENT)? {
            config.pool.alignment = alignment;
            config.manager.alignment = alignment;
        }
        if let Some(thread_safe) = read_env::<bool>(ENV_THREAD_SAFE)? {
            config.pool.thread_safe = thread_safe;
        }
        if let Some(track_usage) = read_env::<bool>(ENV_TRACK_USAGE)? {
            config.pool.track_usage = track_usage;
        }
        if let Some(check_leak) = read_env::<bool>(ENV_CHECK_LEAK)? {
            config.pool.check_usage_leak = check_leak;
        }
        if let Some(capacity) = read_env::<u64>(ENV_CAPACITY)? {
            config.pool.capacity = capacity;
        }
        if let Some(threshold) = read_env::<u64>(ENV_SPILL_THRESHOLD)? {
            config.spill_threshold = threshold;
        }
        if let Some(level) = read_env::<String>(ENV_LOG_LEVEL)? {
            config.logging.level = level;
        }
        if let Some(json) = read_env::<bool>(ENV_LOG_JSON)? {
            config.logging.json = json;
        }
        if let Some(allocation_trace) = read_env::<bool>(ENV_LOG_ALLOCATIONS)? {
            config.logging.allocation_trace = allocation_trace;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        validate_alignment(self.manager.alignment)?;
        if self.spill_threshold == 0 {
            return Err(Error::Config("spill threshold must be greater than zero".to_string()));
        }
        self.logging.level()?;
        Ok(())
    }
}

pub fn validate_alignment(alignment: u16) -> Result<()> {
    if !alignment.is_power_of_two() || !(MIN_ALIGNMENT..=MAX_ALIGNMENT).contains(&alignment) {
        return Err(Error::InvalidAlignment {
            alignment,
            min: MIN_ALIGNMENT,
            max: MAX_ALIGNMENT,
        });
    }
    Ok(())
}

fn read_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {}: {}", key, raw))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Config(format!("{}: {}", key, e))),
    }
}
