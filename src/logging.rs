//! Subscriber bootstrap for binaries, benches and tests that embed the bridge.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to whoever owns the process.

use crate::config::{BridgeConfig, LoggingOptions};
use crate::error::{Error, Result};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

const CRATE_TARGET: &str = "lightning_pool_bridge";

// modules whose per-page trace! events allocation_trace turns on
const ALLOCATION_TARGETS: [&str; 2] = ["native", "adapter"];

/// Filter used when `RUST_LOG` is unset. Other crates stay at `warn`.
pub fn default_directives(options: &LoggingOptions) -> Result<String> {
    let level = options.level()?;
    let mut directives = format!("{}={},warn", CRATE_TARGET, level);
    if options.allocation_trace {
        for module in ALLOCATION_TARGETS {
            directives.push_str(&format!(",{}::{}=trace", CRATE_TARGET, module));
        }
    }
    Ok(directives)
}

/// Installs the global subscriber described by `options`.
///
/// Fails with [`Error::Logging`] if a global subscriber is already set, so
/// every test may call it and ignore the result.
pub fn init_logging(options: &LoggingOptions) -> Result<()> {
    let directives = default_directives(options)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let json_layer = options.json.then(|| {
        fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_current_span(false)
            .with_thread_ids(true)
            .with_thread_names(true)
    });
    let text_layer = (!options.json).then(|| {
        fmt::layer()
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_names(true)
    });

    Registry::default()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

/// [`init_logging`] with the `logging` section of `config`.
pub fn init_from_config(config: &BridgeConfig) -> Result<()> {
    init_logging(&config.logging)
}
