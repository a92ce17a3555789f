//! Tracing bootstrap for the fluxgate binary.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber: `RUST_LOG` wins, default `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
