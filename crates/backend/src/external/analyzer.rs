use async_trait::async_trait;

use crate::domain::outcome::{AnalysisError, AnalysisOutput};

/// Per-file analysis capability.
///
/// Implementations must be safe to call concurrently for different keys.
/// The pipeline enforces the per-task deadline by dropping the future, so
/// implementations should not rely on running to completion.
#[async_trait]
pub trait Analyzer: Send + Sync {
  /// Analyze a single file identified by `key`
  async fn analyze(&self, key: &str) -> Result<AnalysisOutput, AnalysisError>;

  /// Drop anything cached for `key` after the file was deleted
  async fn forget(&self, _key: &str) {}
}
