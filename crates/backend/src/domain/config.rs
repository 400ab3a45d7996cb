//! Configuration system for depflow with per-project overrides.
//!
//! Config priority: project-relative (.depflow/config.toml) > user (~/.config/depflow/config.toml) > defaults

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Priority
// ============================================================================

/// Scheduling priority, biasing the configured concurrency bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  /// Favor throughput over memory headroom
  Speed,
  #[default]
  Balanced,
  /// Favor memory headroom over throughput
  Memory,
}

/// Multiplier applied to the configured concurrency for each priority.
const PRIORITY_MULTIPLIERS: &[(Priority, f64)] = &[
  (Priority::Speed, 2.0),
  (Priority::Balanced, 1.0),
  (Priority::Memory, 0.5),
];

impl Priority {
  pub fn multiplier(&self) -> f64 {
    PRIORITY_MULTIPLIERS
      .iter()
      .find(|(p, _)| p == self)
      .map(|(_, m)| *m)
      .unwrap_or(1.0)
  }

  /// Apply the priority bias to a configured bound. Never drops below 1.
  pub fn bias(&self, configured: usize) -> usize {
    let biased = (configured as f64 * self.multiplier()).round() as usize;
    biased.max(1)
  }
}

impl std::str::FromStr for Priority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "speed" => Ok(Priority::Speed),
      "balanced" => Ok(Priority::Balanced),
      "memory" => Ok(Priority::Memory),
      other => Err(format!("unknown priority: {other}")),
    }
  }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Delay strategy between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
  /// Same delay before every retry
  #[default]
  Fixed,
  /// Delay doubles with each attempt, capped at `max_backoff_ms`
  Exponential,
}

// ============================================================================
// Resource Limits
// ============================================================================

/// Resource bounds applied to newly admitted tasks.
///
/// Updating limits never affects tasks that were already admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
  /// Maximum simultaneously running analysis calls (default: 3)
  pub max_concurrency: usize,
  /// Process memory ceiling in MB (default: 2048)
  pub max_memory_mb: u64,
  /// Files larger than this are skipped without analysis (default: 1MB)
  pub max_file_size_bytes: u64,
  /// Per-task analysis timeout in milliseconds (default: 30000)
  pub timeout_ms: u64,
}

impl Default for ResourceLimits {
  fn default() -> Self {
    Self {
      max_concurrency: 3,
      max_memory_mb: 2048,
      max_file_size_bytes: 1024 * 1024,
      timeout_ms: 30_000,
    }
  }
}

impl ResourceLimits {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  pub level: String,

  /// Log file rotation: "daily", "hourly", "never"
  /// Default: "daily"
  pub rotation: String,

  /// Directory for log files. Console logging when unset.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      rotation: "daily".to_string(),
      dir: None,
    }
  }
}

// ============================================================================
// Pipeline Configuration
// ============================================================================

/// Main configuration for the analysis pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// Concurrent analysis calls (default: 3)
  pub max_concurrency: usize,

  /// Memory ceiling in MB used for resource classification (default: 2048)
  pub memory_limit_mb: u64,

  /// Maximum file size to analyze in bytes (default: 1MB)
  pub max_file_size_bytes: u64,

  /// Per-file analysis timeout in milliseconds (default: 30000)
  pub timeout_ms: u64,

  /// Keep going after a file gives up (default: true)
  pub continue_on_error: bool,

  /// Retry transient failures at all (default: true)
  pub retry_failed_files: bool,

  /// Retries after the first attempt (default: 3)
  pub max_retries: u32,

  /// Delay before each retry in milliseconds (default: 2000)
  pub retry_delay_ms: u64,

  /// Retry delay strategy (default: fixed)
  pub backoff: BackoffStrategy,

  /// Cap for exponential backoff in milliseconds (default: 30000)
  pub max_backoff_ms: u64,

  /// Quiet window before a changed file is queued (default: 500)
  pub debounce_delay_ms: u64,

  /// Concurrency bias (default: balanced)
  pub priority: Priority,

  /// Resource sampling interval in milliseconds (default: 1000)
  pub monitor_interval_ms: u64,

  /// Include globs for directory mode, relative to the root
  pub patterns: Vec<String>,

  /// Exclude globs for directory mode and the watcher
  pub exclude_patterns: Vec<String>,

  /// Logging settings
  pub log: LogConfig,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      max_concurrency: 3,
      memory_limit_mb: 2048,
      max_file_size_bytes: 1024 * 1024,
      timeout_ms: 30_000,
      continue_on_error: true,
      retry_failed_files: true,
      max_retries: 3,
      retry_delay_ms: 2000,
      backoff: BackoffStrategy::Fixed,
      max_backoff_ms: 30_000,
      debounce_delay_ms: 500,
      priority: Priority::Balanced,
      monitor_interval_ms: 1000,
      patterns: default_patterns(),
      exclude_patterns: default_exclude_patterns(),
      log: LogConfig::default(),
    }
  }
}

fn default_patterns() -> Vec<String> {
  ["ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java"]
    .iter()
    .map(|ext| format!("**/*.{ext}"))
    .collect()
}

fn default_exclude_patterns() -> Vec<String> {
  ["node_modules", "dist", "build", "target", ".git", "__pycache__", ".venv"]
    .iter()
    .map(|dir| format!("**/{dir}"))
    .collect()
}

impl PipelineConfig {
  /// Resource limits derived from this config
  pub fn limits(&self) -> ResourceLimits {
    ResourceLimits {
      max_concurrency: self.max_concurrency.max(1),
      max_memory_mb: self.memory_limit_mb,
      max_file_size_bytes: self.max_file_size_bytes,
      timeout_ms: self.timeout_ms,
    }
  }

  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_delay_ms)
  }

  pub fn monitor_interval(&self) -> Duration {
    Duration::from_millis(self.monitor_interval_ms.max(10))
  }

  /// Load config for a project, with fallback to user config
  pub fn load_for_project(project_path: &Path) -> Self {
    let project_config = Self::project_config_path(project_path);
    if project_config.exists()
      && let Ok(content) = std::fs::read_to_string(&project_config)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }

    if let Some(user_config_path) = Self::user_config_path()
      && user_config_path.exists()
      && let Ok(content) = std::fs::read_to_string(&user_config_path)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }

    Self::default()
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("depflow").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("depflow").join("config.toml"))
  }

  /// Get the project-relative config path
  pub fn project_config_path(project_path: &Path) -> PathBuf {
    project_path.join(".depflow").join("config.toml")
  }
}
