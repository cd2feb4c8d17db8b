use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default log directory: `~/.shotfarm/logs`
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shotfarm")
        .join("logs")
}

/// Log file prefix for a run command, e.g. `forward.log.2026-10-19`
pub fn run_log_name(command: &str) -> String {
    format!("{}.log", command)
}

fn filter(level: &str) -> EnvFilter {
    // RUST_LOG wins over --log-level
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Logging for long runs (`forward`, `invert`).
///
/// Every event goes to a daily rotating file named after the command, with
/// targets and line numbers so worker slots can be traced back. Stdout
/// stays compact.
pub fn init_production_logging(
    command: &str,
    level: &str,
    log_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, run_log_name(command));
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter(level))
        .with(file_layer)
        .with(fmt::layer().compact().with_target(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    log_started(command, level, &log_dir);
    Ok(())
}

fn log_started(command: &str, level: &str, log_dir: &Path) {
    tracing::info!(
        command,
        level,
        log_dir = %log_dir.display(),
        pid = std::process::id(),
        "Run logging initialized"
    );
}

/// Stdout-only logging for short commands (`init-model`, `scan`).
pub fn init_simple_logging(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().compact().with_target(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
