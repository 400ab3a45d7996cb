//! WatcherTask - bridges a change source to the watch queue
//!
//! The task consumes a [`ChangeStream`], drops paths outside the configured
//! include/exclude globs, debounces the rest, and forwards settled triggers to
//! the [`WatchQueueHandle`].
//!
//! # Event Flow
//!
//! ```text
//! ChangeSource ─▶ PathFilter ─▶ ChangeDebouncer ─▶ WatchQueue
//!                                 │ deletions skip the wait
//! ```
//!
//! A source error is fatal to the watcher. It is reported through
//! `watcher_error` and returned; batch runs are unaffected. Events still
//! inside their debounce window when the task stops are discarded.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::{
  debounce::{ChangeDebouncer, Recorded, Trigger},
  events::EventDispatcher,
  queue::WatchQueueHandle,
};
use crate::{
  domain::task::ChangeEvent,
  external::{ChangeStream, PathFilter, WatcherError},
};

pub struct WatcherTask {
  stream: ChangeStream,
  filters: Vec<PathFilter>,
  debouncer: ChangeDebouncer,
  queue: WatchQueueHandle,
  events: EventDispatcher,
  cancel: CancellationToken,
}

impl WatcherTask {
  pub fn new(
    stream: ChangeStream,
    filters: Vec<PathFilter>,
    debounce: Duration,
    queue: WatchQueueHandle,
    events: EventDispatcher,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      stream,
      filters,
      debouncer: ChangeDebouncer::new(debounce),
      queue,
      events,
      cancel,
    }
  }

  /// Run until cancelled, the stream ends, or the source fails
  pub async fn run(mut self) -> Result<(), WatcherError> {
    info!(roots = self.filters.len(), "WatcherTask started");

    let result = self.event_loop().await;

    if let Err(e) = &result {
      error!(error = %e, "WatcherTask failed");
      self.events.watcher_error(e);
    }

    if !self.debouncer.is_empty() {
      debug!(pending = self.debouncer.len(), "Discarding debounced events on shutdown");
    }

    info!("WatcherTask stopped");
    result
  }

  async fn event_loop(&mut self) -> Result<(), WatcherError> {
    loop {
      let deadline = self.debouncer.next_deadline();

      tokio::select! {
          biased;

          _ = self.cancel.cancelled() => {
              info!("WatcherTask shutting down (cancelled)");
              return Ok(());
          }

          event = self.stream.events.recv() => {
              match event {
                  Some(Ok(event)) => self.on_event(event).await?,
                  Some(Err(e)) => return Err(e),
                  None => {
                      info!("WatcherTask shutting down (stream closed)");
                      return Ok(());
                  }
              }
          }

          _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
              self.flush_due().await?;
          }
      }
    }
  }

  async fn on_event(&mut self, event: ChangeEvent) -> Result<(), WatcherError> {
    if !self.is_watched(&event) {
      trace!(path = %event.path.display(), "Ignoring filtered path");
      return Ok(());
    }

    trace!(path = %event.path.display(), kind = ?event.kind, "Change received");

    match self.debouncer.record(event, Instant::now()) {
      Recorded::Immediate(trigger) => forward(&self.queue, trigger).await,
      Recorded::Deferred | Recorded::Coalesced => Ok(()),
    }
  }

  async fn flush_due(&mut self) -> Result<(), WatcherError> {
    for trigger in self.debouncer.due(Instant::now()) {
      forward(&self.queue, trigger).await?;
    }
    Ok(())
  }

  fn is_watched(&self, event: &ChangeEvent) -> bool {
    self
      .filters
      .iter()
      .any(|f| f.covers(&event.path) && f.accepts(&event.path, false))
  }
}

// Borrows only the queue handle so the task future stays Send
async fn forward(queue: &WatchQueueHandle, trigger: Trigger) -> Result<(), WatcherError> {
  debug!(
    path = %trigger.event.path.display(),
    kind = ?trigger.event.kind,
    merged = trigger.merged,
    "Change settled"
  );
  queue.enqueue(trigger).await
}

impl std::fmt::Debug for WatcherTask {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WatcherTask")
      .field("filters", &self.filters)
      .field("pending", &self.debouncer.len())
      .finish_non_exhaustive()
  }
}
