//! Tracing subscriber setup.
//!
//! Console output in pretty or JSON format per config, plus optional
//! daily-rolling files under `<data_dir>/logs/`.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::domain::models::config::LoggingConfig;
use crate::infrastructure::storage::DataDir;

/// Initialize the global subscriber. The returned guard must be held for
/// the life of the process so buffered file output is flushed.
pub fn init(config: &LoggingConfig, data_dir: Option<&DataDir>) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();
    if config.format == "json" {
        layers.push(fmt::layer().json().boxed());
    } else {
        layers.push(fmt::layer().boxed());
    }

    let mut guard = None;
    if config.to_files {
        if let Some(dir) = data_dir {
            let appender = tracing_appender::rolling::daily(dir.logs(), "panion.log");
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
            guard = Some(file_guard);
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .ok();

    Ok(guard)
}
