//! Log output for applications built on Kestrel
//!
//! The kernel emits its records through the `log` facade under
//! `kestrel::*` targets. [`init`] installs a `tracing-subscriber` formatter
//! that also picks up those records, filtered by `RUST_LOG`.

use anyhow::anyhow;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "kestrel=info";

/// Install the global subscriber with [`DEFAULT_FILTER`]
pub fn init() -> anyhow::Result<()> {
    init_with(DEFAULT_FILTER)
}

/// Install the global subscriber, falling back to `default_filter`
///
/// Fails if a global subscriber or logger is already installed.
pub fn init_with(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| anyhow!("invalid log filter '{}': {}", default_filter, e))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {}", e))?;

    tracing::debug!(version = crate::VERSION, "kestrel logging initialized");
    Ok(())
}
