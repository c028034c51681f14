//! Opt-in tracing setup.
//!
//! The engine emits structured `tracing` events throughout the pipeline but
//! never installs a global subscriber itself. Applications that want
//! human-readable output without wiring their own subscriber can call
//! [`init`] once at startup; libraries embedding the engine should skip it
//! and bring their own.

use tracing_subscriber::EnvFilter;

/// Installs a formatted `tracing` subscriber filtered by `RUST_LOG`
/// (default level: `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
