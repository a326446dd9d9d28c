//! Logging module for the sandbox engine
//!
//! Provides structured logging with tracing, supporting JSON output when the
//! process is not attached to a terminal and pretty printing otherwise.
//! Everything is written to stderr so stdout stays free for command results.

use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Map a configured level name onto a tracing level (unknown names fall back to INFO)
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the logging/tracing system
///
/// `RUST_LOG` takes precedence over `log_level` when set.
pub fn init_logging(log_level: &str) -> Result<(), TryInitError> {
    let level = parse_level(log_level);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "pysandbox_orchestrator={level},pysandbox={level},warn",
            level = level
        ))
    });

    if std::io::stderr().is_terminal() {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .pretty()
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
    }
}
