//! Logging setup for applications embedding the pipeline

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::domain::config::LogConfig;

const LOG_FILE: &str = "depflow.log";

/// Parse log level from config string. `None` turns logging off.
pub fn parse_log_level(level: &str) -> Option<tracing::Level> {
  match level.to_lowercase().as_str() {
    "off" => None,
    "error" => Some(tracing::Level::ERROR),
    "warn" => Some(tracing::Level::WARN),
    "info" => Some(tracing::Level::INFO),
    "debug" => Some(tracing::Level::DEBUG),
    "trace" => Some(tracing::Level::TRACE),
    _ => Some(tracing::Level::INFO),
  }
}

/// Env filter from config; `RUST_LOG` overrides the configured level
pub fn build_filter(config: &LogConfig) -> EnvFilter {
  let directive = match parse_log_level(&config.level) {
    Some(level) => level.into(),
    None => tracing_subscriber::filter::LevelFilter::OFF.into(),
  };

  EnvFilter::builder().with_default_directive(directive).from_env_lossy()
}

/// Initialize the global subscriber.
///
/// Without `dir`: console with colors. With `dir`: rolling file, no ANSI.
/// Returns the guard that must be kept alive for file logging. A subscriber
/// that is already installed is left in place.
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
  let env_filter = build_filter(config);

  let Some(log_dir) = &config.dir else {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .try_init();
    return None;
  };

  if let Err(e) = std::fs::create_dir_all(log_dir) {
    // Fall back to console-only logging
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    tracing::warn!(dir = %log_dir.display(), error = %e, "Log directory unavailable, logging to console");
    return None;
  }

  let file_appender = match config.rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(log_dir, LOG_FILE),
    "never" => tracing_appender::rolling::never(log_dir, LOG_FILE),
    _ => tracing_appender::rolling::daily(log_dir, LOG_FILE),
  };

  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let _ = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .try_init();

  Some(guard)
}
