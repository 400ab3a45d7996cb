//! Change sources - OS-level file notifications
//!
//! [`NotifySource`] bridges notify's sync callbacks into an async channel:
//! the callback uses `blocking_send` to forward translated events, and the
//! watcher task consumes them from the receiving end.

use std::{any::Any, path::PathBuf};

use notify::{
  Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
  event::{ModifyKind, RenameMode},
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::domain::task::{ChangeEvent, ChangeKind};

/// Errors from the watcher subsystem.
///
/// All of these are fatal to the watcher but never affect batch runs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatcherError {
  #[error("Failed to initialize watcher: {0}")]
  Init(String),
  #[error("Failed to watch path {path}: {reason}")]
  Watch { path: PathBuf, reason: String },
  #[error("Change source failed: {0}")]
  Source(String),
  #[error("Watcher is already running")]
  AlreadyRunning,
  #[error("Watch queue has shut down")]
  QueueClosed,
}

/// Live change notifications for a set of watched paths.
///
/// Dropping the stream stops the underlying notification source.
pub struct ChangeStream {
  pub events: mpsc::Receiver<Result<ChangeEvent, WatcherError>>,
  _guard: Option<Box<dyn Any + Send>>,
}

impl ChangeStream {
  /// Wrap a receiver and whatever must stay alive to keep it fed
  pub fn new(events: mpsc::Receiver<Result<ChangeEvent, WatcherError>>, guard: Option<Box<dyn Any + Send>>) -> Self {
    Self { events, _guard: guard }
  }
}

impl std::fmt::Debug for ChangeStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ChangeStream").finish_non_exhaustive()
  }
}

/// Produces change notifications for a set of paths
pub trait ChangeSource: Send + Sync {
  fn watch(&self, paths: &[PathBuf]) -> Result<ChangeStream, WatcherError>;
}

// ============================================================================
// Notify Source
// ============================================================================

/// Default [`ChangeSource`] using notify's recommended OS backend
#[derive(Debug, Clone)]
pub struct NotifySource {
  /// Channel buffer between notify's thread and the watcher task
  pub buffer: usize,
}

impl Default for NotifySource {
  fn default() -> Self {
    Self { buffer: 256 }
  }
}

impl ChangeSource for NotifySource {
  fn watch(&self, paths: &[PathBuf]) -> Result<ChangeStream, WatcherError> {
    let (tx, rx) = mpsc::channel(self.buffer.max(1));

    let mut watcher = RecommendedWatcher::new(
      move |res: Result<Event, notify::Error>| {
        // This runs on notify's thread; if the receiver is gone we drop the event
        match res {
          Ok(event) => {
            for change in translate(&event) {
              let _ = tx.blocking_send(Ok(change));
            }
          }
          Err(e) => {
            let _ = tx.blocking_send(Err(WatcherError::Source(e.to_string())));
          }
        }
      },
      Config::default(),
    )
    .map_err(|e| WatcherError::Init(e.to_string()))?;

    for path in paths {
      watcher
        .watch(path, RecursiveMode::Recursive)
        .map_err(|e| WatcherError::Watch {
          path: path.clone(),
          reason: e.to_string(),
        })?;
      info!(path = %path.display(), "Watching path");
    }

    Ok(ChangeStream::new(rx, Some(Box::new(watcher))))
  }
}

/// Translate a notify event into zero or more change events
fn translate(event: &Event) -> Vec<ChangeEvent> {
  let kind = match event.kind {
    EventKind::Create(_) => ChangeKind::Created,
    EventKind::Modify(ModifyKind::Name(mode)) => match mode {
      RenameMode::Both if event.paths.len() >= 2 => {
        // paths[0] = from, paths[1] = to
        let from = &event.paths[0];
        let to = &event.paths[1];
        debug!(from = %from.display(), to = %to.display(), "File renamed");
        let mut changes = vec![ChangeEvent::deleted(from.clone())];
        if !to.is_dir() {
          changes.push(ChangeEvent::created(to.clone()));
        }
        return changes;
      }
      RenameMode::From => ChangeKind::Deleted,
      RenameMode::To => ChangeKind::Created,
      _ => ChangeKind::Modified,
    },
    EventKind::Modify(_) => ChangeKind::Modified,
    EventKind::Remove(_) => ChangeKind::Deleted,
    EventKind::Access(_) | EventKind::Any | EventKind::Other => {
      trace!(kind = ?event.kind, "Ignoring event");
      return Vec::new();
    }
  };

  event
    .paths
    .iter()
    .filter(|path| kind == ChangeKind::Deleted || !path.is_dir())
    .map(|path| ChangeEvent::new(path.clone(), kind))
    .collect()
}
