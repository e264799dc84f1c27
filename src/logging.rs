//! File-based logging module for loop-deck
//!
//! Logs go to a file so they never interleave with the interactive prompt on
//! stdout.

use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_DIR: &str = ".logs";
const LOG_FILE_PREFIX: &str = "loop-deck";

/// Initialize the logging system.
///
/// Logs are written to `.logs/loop-deck.YYYY-MM-DD.log` with daily rotation.
/// The log level can be controlled via the `RUST_LOG` environment variable.
///
/// Default log levels:
/// - `loop_deck` modules: DEBUG
/// - `rspotify`: INFO
/// - Other crates: WARN
pub fn init_logging() -> anyhow::Result<()> {
    let log_dir = Path::new(LOG_DIR);
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, LOG_FILE_PREFIX);

    // Non-blocking writer so logging never stalls the runtime
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The guard must outlive every log call; keep it for the whole process
    Box::leak(Box::new(guard));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("loop_deck=debug,rspotify=info,warn"));

    let fmt_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_span_events(FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Logging initialized - logs written to {}/", LOG_DIR);

    Ok(())
}

/// Log the outcome of a device command
#[macro_export]
macro_rules! log_command_result {
    ($command:expr, $result:expr) => {
        match &$result {
            Ok(_) => tracing::debug!(command = $command, "Device command succeeded"),
            Err(e) => tracing::warn!(command = $command, error = %e, "Device command failed"),
        }
    };
}
