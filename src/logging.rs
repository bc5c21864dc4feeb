//! Tracing subscriber setup.
//!
//! Console output is always on; `--log-json` switches it to JSON lines. When
//! a log directory is given a second, JSON-formatted layer writes to a daily
//! rolling file through a non-blocking writer. The returned guard must be kept
//! alive for the lifetime of the process or buffered lines are lost.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

const LOG_FILE_PREFIX: &str = "forgeflow.log";

fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "forgeflow=debug,info" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Safe to call when one is already set; the
/// existing subscriber wins.
pub fn init(verbose: bool, json: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let console: BoxedLayer = if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter(verbose))
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter(verbose))
            .boxed()
    };

    layers.push(console);

    let guard = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(writer)
                    .with_filter(filter(verbose))
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    if tracing_subscriber::registry().with(layers).try_init().is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }

    if let Some(dir) = log_dir {
        tracing::info!(log_dir = %dir.display(), "file logging enabled");
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_with_log_dir_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs");
        let guard = init(false, false, Some(&dir)).unwrap();
        assert!(dir.is_dir());
        assert!(guard.is_some());
        // A second install is tolerated.
        assert!(init(true, true, None).unwrap().is_none());
    }
}
