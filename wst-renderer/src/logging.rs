//! Logging setup for hosts that do not install their own subscriber.
//!
//! The render core only emits `tracing` events. A compositor that already
//! configures `tracing` needs nothing from here.

use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes a minimal logging setup, directing messages to `stderr`.
///
/// Messages are filtered by `RUST_LOG`, defaulting to `info` when it is
/// unset or invalid. Calling this after a global subscriber is installed is
/// harmless.
pub fn init_minimal_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_initialisation_is_ignored() {
        init_minimal_logging();
        init_minimal_logging();
        tracing::info!("logging initialised twice");
    }
}
