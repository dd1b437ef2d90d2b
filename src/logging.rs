//! Diagnostic tracing for the orchestrator.
//!
//! - **stderr**: human-readable, compact, filtered by `RUST_LOG`
//!   (default `crucible=info`, `crucible=debug` with `--verbose`).
//! - **`.crucible/logs/crucible.jsonl`**: the same events as JSON lines,
//!   written when a log directory is available.
//!
//! Product artifacts (event stream, decision log, reports) are separate and
//! are always written regardless of the filter.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Returns the appender guard; dropping it flushes the JSON log. Calling
/// this twice is harmless (the second install is ignored).
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_level = if verbose { "crucible=debug" } else { "crucible=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "crucible.jsonl");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(file_layer)
        .try_init();

    if result.is_err() {
        return None;
    }
    guard
}
