//! Tracing subscriber setup for the binary.
//!
//! Logs go to stderr so `--json` output on stdout stays machine-readable.

use crate::core::error::{RekeyError, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

pub fn parse_level(verbosity: &str) -> Level {
    match verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbosity` when set.
pub fn setup_logging(verbosity: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(parse_level(verbosity).as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = match format {
        "json" => builder.json().try_init(),
        "text" => builder.try_init(),
        other => {
            return Err(RekeyError::ConfigError(format!(
                "unknown log format '{}', expected 'text' or 'json'",
                other
            )));
        }
    };
    installed.map_err(|e| RekeyError::ConfigError(format!("failed to install logger: {}", e)))
}
