//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber. Safe to call more than once; later
/// calls are no-ops (tests init from multiple entry points).
pub fn init(default_filter: &str) {
    let filter = EnvFilter::builder()
        .with_env_var("SNAPBRIDGE_LOG")
        .try_from_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
