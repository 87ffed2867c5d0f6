//! One-time `tracing` subscriber initialization.
//!
//! Mirrors the `tracing::info!/warn!/error!` call sites already present in the
//! teacher project's own async modules; no `println!`/`eprintln!` remain in
//! library code.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber. Must be called exactly once, before any
/// other component logs. Panics on a second call are intentional — it is a
/// programming error, not a recoverable runtime condition.
pub fn init(filter: &str) {
    let env_filter =
        EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}
