//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Environment variable holding the filter directive
pub const LOG_ENV: &str = "LTBOX_LOG";

const DEFAULT_FILTER: &str = "ltbox=info,warn";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Initialize the logging subsystem
///
/// Logs go to `<data_local_dir>/ltbox/logs/ltbox.log` (rotated daily) and to
/// stderr. Level is controlled by the `LTBOX_LOG` environment variable.
///
/// # Examples
/// ```bash
/// LTBOX_LOG=debug ltbox flash-all --loader prog.elf
/// LTBOX_LOG=ltbox_device=trace ltbox detect-slot
/// ```
pub fn init() -> Result<()> {
    let log_dir = log_directory()?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "ltbox.log");

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(TIMESTAMP_FORMAT.to_string())),
        )
        .with(
            fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_timer(fmt::time::ChronoLocal::new("%H:%M:%S".to_string())),
        )
        .init();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("LTBox starting");
    tracing::info!("Log directory: {}", log_dir.display());
    tracing::info!("═══════════════════════════════════════════════════════");

    Ok(())
}

/// Filter from `LTBOX_LOG`, falling back to the default directive
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Directory holding the daily `ltbox.log.<date>` files
pub fn log_directory() -> Result<PathBuf> {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    Ok(base.join("ltbox").join("logs"))
}
