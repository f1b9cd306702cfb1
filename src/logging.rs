//! Tracing initialisation for the `adw` binary.
//!
//! `RUST_LOG` wins over the level passed in. Only the first call installs a
//! subscriber; later calls are ignored.

use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

const LOG_FILE_PREFIX: &str = "adw";

/// Install the global subscriber.
///
/// * `json` - emit newline-delimited JSON on stderr instead of text.
/// * `level` - default verbosity when `RUST_LOG` is not set.
/// * `log_dir` - when given, also write JSON lines to a daily-rolling file
///   there. Keep the returned guard alive until exit or buffered lines are lost.
pub fn init_tracing(json: bool, level: Level, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let console = if json {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .json()
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match log_dir.and_then(file_appender) {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .ok();

    guard
}

fn file_appender(dir: &Path) -> Option<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .map_err(|e| eprintln!("file logging disabled: {e}"))
        .ok()
}

/// `-v` selects debug, otherwise info.
pub fn level_for(verbose: bool) -> Level {
    if verbose { Level::DEBUG } else { Level::INFO }
}
