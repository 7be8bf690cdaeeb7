//! Tracing subscriber setup for the session runtime and its binary.

use tracing_subscriber::EnvFilter;

use crate::config::EnvConfig;

const DEFAULT_FILTER: &str = "info";

/// Builds the filter: `THREAD_SESSION_LOG`, then `RUST_LOG`, then `info`.
/// An unparsable directive falls back to the default.
pub fn env_filter(config: &EnvConfig) -> EnvFilter {
    match config.log_filter.as_deref() {
        Some(directive) => {
            EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    }
}

/// Installs a fmt subscriber writing to stderr. Returns false when a global
/// subscriber was already installed.
pub fn init_tracing(config: &EnvConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok()
}
