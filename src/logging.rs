//! Tracing setup for hosts that do not install their own subscriber.

use tracing_subscriber::EnvFilter;

/// Default filter: warn for dependencies, info for the engine
const DEFAULT_FILTER: &str = "warn,entitlement_engine=info";

/// Initialize tracing with the RUST_LOG env filter.
///
/// Use RUST_LOG=entitlement_engine=debug for per-call cache and fetch logs.
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .try_init();
}
