//! Logging utilities for floaty components.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing on stderr.
///
/// The default level is INFO, or DEBUG when `verbose` is set; RUST_LOG
/// overrides both. `json` switches the output to structured JSON records.
pub fn init(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}
