//! Structured logging setup.
//!
//! # Responsibilities
//! - Initialize the tracing subsystem for binaries and tests
//! - Configure log level via the environment
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Level configurable via RUST_LOG, defaults to info

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
