use std::path::Path;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

/// Install the global subscriber: stderr always, plus a daily rolling file when `logs_dir`
/// is set. `RUST_LOG` wins over `default_level`.
///
/// Keep the returned guard alive for as long as file logging should be flushed.
pub fn init(default_level: &str, logs_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout is reserved for outbound messages in the console gateway
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, guard) = match logs_dir {
        Some(dir) => {
            let file_appender = rolling::daily(dir, concat!(env!("CARGO_PKG_NAME"), ".log"));
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}
