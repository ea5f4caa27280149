//! Structured logging setup shared by the master and worker processes.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber writing to stderr. `default_level`
/// seeds the filter when `RUST_LOG` is unset; otherwise the environment
/// wins.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
