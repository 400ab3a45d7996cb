//! Units of work and filesystem change events.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::outcome::AnalysisError;

// ============================================================================
// Analysis Task
// ============================================================================

/// Lifecycle of a single analysis task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
  Pending,
  Running,
  Retrying,
  Succeeded,
  Failed,
  Cancelled,
  /// Rejected before analysis (file over the size limit)
  Skipped,
}

impl TaskState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled | TaskState::Skipped
    )
  }
}

/// A unit of work owned by exactly one coordinator
#[derive(Debug, Clone)]
pub struct AnalysisTask {
  pub key: String,
  pub state: TaskState,
  /// Zero-based attempt counter, incremented on every retry
  pub attempt: u32,
  /// Earliest instant the task may be admitted
  pub scheduled_at: Instant,
  pub last_error: Option<AnalysisError>,
}

impl AnalysisTask {
  pub fn new(key: impl Into<String>, now: Instant) -> Self {
    Self {
      key: key.into(),
      state: TaskState::Pending,
      attempt: 0,
      scheduled_at: now,
      last_error: None,
    }
  }

  /// Pending and past its scheduled time
  pub fn is_ready(&self, now: Instant) -> bool {
    self.state == TaskState::Pending && self.scheduled_at <= now
  }

  /// Move to Retrying with the next attempt scheduled at `at`
  pub fn schedule_retry(&mut self, at: Instant, error: AnalysisError) {
    self.state = TaskState::Retrying;
    self.attempt += 1;
    self.scheduled_at = at;
    self.last_error = Some(error);
  }

  /// Retrying tasks whose delay elapsed go back to Pending
  pub fn wake(&mut self, now: Instant) -> bool {
    if self.state == TaskState::Retrying && self.scheduled_at <= now {
      self.state = TaskState::Pending;
      true
    } else {
      false
    }
  }
}

// ============================================================================
// Change Events
// ============================================================================

/// The kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
  Created,
  Modified,
  Deleted,
}

/// A filesystem change reported by a change source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub path: PathBuf,
  pub kind: ChangeKind,
  pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
  pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
    Self {
      path: path.into(),
      kind,
      timestamp: Utc::now(),
    }
  }

  pub fn created(path: impl Into<PathBuf>) -> Self {
    Self::new(path, ChangeKind::Created)
  }

  pub fn modified(path: impl Into<PathBuf>) -> Self {
    Self::new(path, ChangeKind::Modified)
  }

  pub fn deleted(path: impl Into<PathBuf>) -> Self {
    Self::new(path, ChangeKind::Deleted)
  }

  pub fn is_delete(&self) -> bool {
    self.kind == ChangeKind::Deleted
  }

  /// Task key for this event's path
  pub fn key(&self) -> String {
    path_key(&self.path)
  }
}

/// Keys are shared between batch and watch work, so both derive them the same way.
pub fn path_key(path: &Path) -> String {
  path.to_string_lossy().into_owned()
}

// ============================================================================
// Queue Entries
// ============================================================================

/// Lifecycle of a watch queue entry.
///
/// Entries are debouncing before they reach the queue; terminal states
/// remove the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
  Queued,
  Processing,
  Retrying,
  Completed,
  Failed,
  Cancelled,
}

impl EntryState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, EntryState::Completed | EntryState::Failed | EntryState::Cancelled)
  }
}

/// One pending path in the watch queue
#[derive(Debug, Clone)]
pub struct QueueEntry {
  pub path: PathBuf,
  pub latest_event: ChangeEvent,
  pub attempt: u32,
  pub scheduled_at: Instant,
  pub state: EntryState,
}

impl QueueEntry {
  pub fn new(event: ChangeEvent, now: Instant) -> Self {
    Self {
      path: event.path.clone(),
      latest_event: event,
      attempt: 0,
      scheduled_at: now,
      state: EntryState::Queued,
    }
  }

  /// Replace the event in place, restarting the attempt count
  pub fn coalesce(&mut self, event: ChangeEvent, now: Instant) {
    self.latest_event = event;
    self.attempt = 0;
    self.scheduled_at = now;
  }

  pub fn key(&self) -> String {
    path_key(&self.path)
  }

  pub fn is_ready(&self, now: Instant) -> bool {
    matches!(self.state, EntryState::Queued | EntryState::Retrying) && self.scheduled_at <= now
  }
}
