//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Environment variable pointing at a log file; stderr is used when unset.
pub const LOG_PATH_ENV_VAR: &str = "LOG_PATH";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// With a `log_path` the output goes to a daily rotated file next to it and
/// the returned guard must be kept alive until shutdown to flush it.
pub fn init(log_path: Option<&Path>) -> Option<WorkerGuard> {
    let file_appender = log_path.and_then(|path| {
        let dir = path.parent()?;
        let prefix = path.file_name()?.to_str()?;
        match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(prefix)
            .max_log_files(3)
            .build(dir)
        {
            Ok(appender) => Some(appender),
            Err(e) => {
                eprintln!("failed to create log file {}: {e}", path.display());
                None
            }
        }
    });

    match file_appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let fmt_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter());
            registry().with(fmt_layer).init();
            Some(guard)
        }
        None => {
            let fmt_layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(env_filter());
            registry().with(fmt_layer).init();
            None
        }
    }
}
