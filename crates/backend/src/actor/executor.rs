//! Governed execution of a single admitted task.
//!
//! Both the batch coordinator and the watch queue spawn these onto a
//! `JoinSet`. Each call holds an [`AdmissionPermit`] for its whole duration
//! and always returns an [`Execution`]; analyzer failures, timeouts and
//! panics are folded into [`ExecOutcome::Failed`]. A panic in `forget` is
//! logged and the removal still completes.

use std::{
  panic::AssertUnwindSafe,
  path::Path,
  sync::Arc,
  time::{Duration, Instant},
};

use futures::FutureExt;
use tracing::{debug, trace, warn};

use super::governor::AdmissionPermit;
use crate::{
  domain::{
    config::ResourceLimits,
    outcome::{AnalysisError, AnalysisOutput},
  },
  external::Analyzer,
};

/// Result of one admitted unit of work
#[derive(Debug)]
pub enum ExecOutcome {
  Analyzed(AnalysisOutput),
  /// Over `max_file_size_bytes`; the analyzer was not called
  Skipped { size: u64 },
  Failed(AnalysisError),
  /// Deletion handled; cached state dropped
  Removed,
}

#[derive(Debug)]
pub struct Execution {
  pub key: String,
  pub outcome: ExecOutcome,
  pub elapsed: Duration,
}

/// Run the analyzer for `key` under the limits captured at admission
pub async fn execute(
  analyzer: Arc<dyn Analyzer>,
  key: String,
  limits: ResourceLimits,
  permit: AdmissionPermit,
) -> Execution {
  let start = Instant::now();

  let outcome = match oversized(&key, limits.max_file_size_bytes).await {
    Some(size) => {
      debug!(key = %key, size, limit = limits.max_file_size_bytes, "Skipping oversized file");
      ExecOutcome::Skipped { size }
    }
    None => analyze(analyzer.as_ref(), &key, limits.timeout()).await,
  };

  permit.release();

  Execution {
    key,
    outcome,
    elapsed: start.elapsed(),
  }
}

/// Drop cached state for a deleted key
pub async fn execute_remove(analyzer: Arc<dyn Analyzer>, key: String, permit: AdmissionPermit) -> Execution {
  let start = Instant::now();

  trace!(key = %key, "Forgetting deleted file");
  if AssertUnwindSafe(analyzer.forget(&key)).catch_unwind().await.is_err() {
    warn!(key = %key, "Analyzer panicked while forgetting file");
  }
  permit.release();

  Execution {
    key,
    outcome: ExecOutcome::Removed,
    elapsed: start.elapsed(),
  }
}

async fn analyze(analyzer: &dyn Analyzer, key: &str, deadline: Duration) -> ExecOutcome {
  let call = AssertUnwindSafe(analyzer.analyze(key)).catch_unwind();

  match tokio::time::timeout(deadline, call).await {
    Ok(Ok(Ok(output))) => {
      trace!(key, "Analysis succeeded");
      ExecOutcome::Analyzed(output)
    }
    Ok(Ok(Err(e))) => {
      debug!(key, error = %e, "Analysis failed");
      ExecOutcome::Failed(e)
    }
    Ok(Err(_)) => {
      warn!(key, "Analyzer panicked");
      ExecOutcome::Failed(AnalysisError::permanent("analyzer panicked"))
    }
    Err(_) => {
      warn!(key, timeout_ms = deadline.as_millis() as u64, "Analysis timed out");
      ExecOutcome::Failed(AnalysisError::Timeout(deadline))
    }
  }
}

/// Size of the file behind `key` if it exceeds `limit`.
///
/// Keys that are not readable files are left for the analyzer to judge.
async fn oversized(key: &str, limit: u64) -> Option<u64> {
  let metadata = tokio::fs::metadata(Path::new(key)).await.ok()?;
  (metadata.is_file() && metadata.len() > limit).then_some(metadata.len())
}
