//! Logging setup and configuration

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the application
///
/// The filter is taken from `RUST_LOG` if set, otherwise from
/// `default_level`. When `log_file` is given, events are additionally
/// written (without ANSI colors) to that file.
pub fn setup_logging(default_level: &str, log_file: Option<&Path>) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Protocol(format!("invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer());

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        None => registry.init(),
    }

    Ok(())
}
