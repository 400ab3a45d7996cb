//! Lifecycle notifications fanned out to observers.
//!
//! Observers are explicit callback fields, set once when the dispatcher is
//! built. The dispatcher is cheap to clone and shared by the batch and watch
//! paths.

use std::sync::Arc;

use crate::{
  actor::monitor::ResourceSnapshot,
  domain::outcome::{AnalysisOutput, FileError},
  external::WatcherError,
};

type ProgressFn = dyn Fn(usize, usize) + Send + Sync;
type FileCompleteFn = dyn Fn(&str, &AnalysisOutput) + Send + Sync;
type FileErrorFn = dyn Fn(&str, &FileError, u32) + Send + Sync;
type ResourceWarningFn = dyn Fn(&ResourceSnapshot) + Send + Sync;
type WatcherErrorFn = dyn Fn(&WatcherError) + Send + Sync;

/// Callback registry for pipeline lifecycle events
#[derive(Clone, Default)]
pub struct EventDispatcher {
  on_progress: Option<Arc<ProgressFn>>,
  on_file_complete: Option<Arc<FileCompleteFn>>,
  on_file_error: Option<Arc<FileErrorFn>>,
  on_resource_warning: Option<Arc<ResourceWarningFn>>,
  on_watcher_error: Option<Arc<WatcherErrorFn>>,
}

impl EventDispatcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Called with `(completed, total)` after every terminal task
  pub fn on_progress(mut self, f: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
    self.on_progress = Some(Arc::new(f));
    self
  }

  /// Called once per successfully analyzed file
  pub fn on_file_complete(mut self, f: impl Fn(&str, &AnalysisOutput) + Send + Sync + 'static) -> Self {
    self.on_file_complete = Some(Arc::new(f));
    self
  }

  /// Called once per file that gave up, with the total attempt count
  pub fn on_file_error(mut self, f: impl Fn(&str, &FileError, u32) + Send + Sync + 'static) -> Self {
    self.on_file_error = Some(Arc::new(f));
    self
  }

  /// Called for every sample at or above the warning threshold
  pub fn on_resource_warning(mut self, f: impl Fn(&ResourceSnapshot) + Send + Sync + 'static) -> Self {
    self.on_resource_warning = Some(Arc::new(f));
    self
  }

  /// Called when the change source fails and the watcher stops
  pub fn on_watcher_error(mut self, f: impl Fn(&WatcherError) + Send + Sync + 'static) -> Self {
    self.on_watcher_error = Some(Arc::new(f));
    self
  }

  pub(crate) fn progress(&self, completed: usize, total: usize) {
    if let Some(f) = &self.on_progress {
      f(completed, total);
    }
  }

  pub(crate) fn file_complete(&self, key: &str, output: &AnalysisOutput) {
    if let Some(f) = &self.on_file_complete {
      f(key, output);
    }
  }

  pub(crate) fn file_error(&self, key: &str, error: &FileError, attempts: u32) {
    if let Some(f) = &self.on_file_error {
      f(key, error, attempts);
    }
  }

  pub(crate) fn resource_warning(&self, snapshot: &ResourceSnapshot) {
    if let Some(f) = &self.on_resource_warning {
      f(snapshot);
    }
  }

  pub(crate) fn watcher_error(&self, error: &WatcherError) {
    if let Some(f) = &self.on_watcher_error {
      f(error);
    }
  }
}

impl std::fmt::Debug for EventDispatcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventDispatcher")
      .field("on_progress", &self.on_progress.is_some())
      .field("on_file_complete", &self.on_file_complete.is_some())
      .field("on_file_error", &self.on_file_error.is_some())
      .field("on_resource_warning", &self.on_resource_warning.is_some())
      .field("on_watcher_error", &self.on_watcher_error.is_some())
      .finish()
  }
}
