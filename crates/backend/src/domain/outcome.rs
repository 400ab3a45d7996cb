//! Error taxonomy and per-file outcomes.
//!
//! Per-file errors ([`AnalysisError`], [`FileError`]) are always recovered
//! inside the coordinators and surface only in result objects. Run-level
//! conditions ([`RunError`]) end the enclosing operation.

use std::time::Duration;

use serde::Serialize;

/// Opaque output of one analysis call
pub type AnalysisOutput = serde_json::Value;

// ============================================================================
// Per-file errors
// ============================================================================

/// A single failed analysis attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
  #[error("Analysis failed: {0}")]
  Transient(String),
  #[error("Analysis failed permanently: {0}")]
  Permanent(String),
  #[error("Analysis timed out after {0:?}")]
  Timeout(Duration),
  #[error("IO error: {0}")]
  Io(String),
}

impl AnalysisError {
  pub fn transient(msg: impl Into<String>) -> Self {
    AnalysisError::Transient(msg.into())
  }

  pub fn permanent(msg: impl Into<String>) -> Self {
    AnalysisError::Permanent(msg.into())
  }

  /// Permanent errors are never retried
  pub fn is_permanent(&self) -> bool {
    matches!(self, AnalysisError::Permanent(_))
  }
}

impl From<std::io::Error> for AnalysisError {
  fn from(e: std::io::Error) -> Self {
    use std::io::ErrorKind;

    match e.kind() {
      ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidData => {
        AnalysisError::Permanent(e.to_string())
      }
      _ => AnalysisError::Io(e.to_string()),
    }
  }
}

/// Final failure of a file after the retry policy gave up
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
  #[error("{source}")]
  Permanent { source: AnalysisError },
  #[error("Gave up after {attempts} attempts: {source}")]
  RetryExhausted { attempts: u32, source: AnalysisError },
}

impl FileError {
  /// Build the final error for a task that made `attempts` attempts
  pub fn give_up(attempts: u32, source: AnalysisError) -> Self {
    if source.is_permanent() {
      FileError::Permanent { source }
    } else {
      FileError::RetryExhausted { attempts, source }
    }
  }

  /// The last underlying analysis error
  pub fn last_error(&self) -> &AnalysisError {
    match self {
      FileError::Permanent { source } | FileError::RetryExhausted { source, .. } => source,
    }
  }
}

/// A file reported in a run's failed list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
  pub key: String,
  /// Total attempts made, including the first
  pub attempts: u32,
  #[serde(serialize_with = "serialize_display")]
  pub error: FileError,
}

fn serialize_display<S: serde::Serializer>(e: &FileError, s: S) -> Result<S::Ok, S::Error> {
  s.collect_str(e)
}

// ============================================================================
// Run-level errors
// ============================================================================

/// Conditions that end a whole run rather than a single file
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
  #[error("Operation cancelled")]
  Cancelled,
  #[error("Resource limit exceeded: {used_mb}MB used, limit {limit_mb}MB")]
  ResourceLimitExceeded { used_mb: u64, limit_mb: u64 },
  #[error("Run aborted after {key} failed")]
  Aborted { key: String },
}
