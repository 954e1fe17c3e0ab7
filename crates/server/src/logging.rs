//! File logging setup.
//!
//! Everything goes to `<data_dir>/logs/server.log` through a non-blocking
//! writer. `DONATRACK_LOG_FILTER` overrides the filter directives and
//! `DONATRACK_LOG_FORMAT` switches between `json` (default) and `pretty`.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::paths;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";

/// Keeps the non-blocking writer alive; hold it for the process lifetime.
pub struct LoggingHandle {
    _guard: WorkerGuard,
}

pub fn init_logging() -> anyhow::Result<LoggingHandle> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join("server.log");

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, "server.log"));

    let filter = match std::env::var("DONATRACK_LOG_FILTER") {
        Ok(spec) => EnvFilter::try_new(spec)?,
        Err(_) => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    let pretty = std::env::var("DONATRACK_LOG_FORMAT")
        .is_ok_and(|format| format.eq_ignore_ascii_case("pretty"));

    let registry = tracing_subscriber::registry();
    if pretty {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_filter(filter),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_filter(filter),
            )
            .init();
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = if pretty { "pretty" } else { "json" },
    );

    Ok(LoggingHandle { _guard: guard })
}
