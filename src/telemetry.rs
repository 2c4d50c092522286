//! Operator diagnostics via `tracing`.
//!
//! Stderr always gets a compact human-readable layer. When a run directory is
//! known, a JSON layer also writes `<run>/logs/harness.log`. The filter comes from
//! `AGENT_LAB_LOG`, then `RUST_LOG`, then `info` (`debug` with `--verbose`).

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "AGENT_LAB_LOG";
pub const HARNESS_LOG_NAME: &str = "harness.log";

fn build_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Keep the returned guard alive until exit so the
/// file layer flushes. A second call is a no-op.
pub fn init_tracing(verbose: bool, logs_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(verbose)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match logs_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, HARNESS_LOG_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(verbose))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}
