//! WatchQueue - the incremental half of the pipeline
//!
//! The queue is an actor: one task owns every entry, the cached results, and
//! the stats. Debounced triggers arrive over an mpsc channel from the watcher;
//! worker completions arrive through a `JoinSet`.
//!
//! # Entry lifecycle
//!
//! ```text
//! Queued ─▶ Processing ─▶ Completed            (removed)
//!   ▲           │      ├─▶ Failed              (removed, reported)
//!   │           │      └─▶ Cancelled           (removed)
//!   └─ Retrying ◀┘
//! ```
//!
//! An event for a path that is already queued replaces the entry's event in
//! place. An event that arrives while the path is Processing is parked on the
//! entry and queued once the running attempt finishes, so the next execution
//! always sees the newest event.
//!
//! Deletions run as removal tasks: no analysis call, the cached result is
//! dropped and the analyzer's `forget` hook runs.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use tokio::{
  sync::{mpsc, oneshot},
  task::{Id, JoinError, JoinHandle, JoinSet},
  time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
  debounce::Trigger,
  events::EventDispatcher,
  executor::{ExecOutcome, Execution, execute, execute_remove},
  governor::{Admission, ConcurrencyGovernor},
  monitor::{MonitorLease, ResourceMonitor},
  retry::{RetryDecision, RetryPolicy},
};
use crate::{
  domain::{
    outcome::{AnalysisError, AnalysisOutput, FileError},
    stats::WatcherStats,
    task::{ChangeEvent, EntryState, QueueEntry, path_key},
  },
  external::{Analyzer, WatcherError},
};

const QUEUE_CHANNEL: usize = 256;
const TICK: Duration = Duration::from_millis(10);

// ============================================================================
// Messages & Handle
// ============================================================================

#[derive(Debug)]
pub enum QueueMessage {
  Enqueue(Trigger),
  Cancel {
    path: PathBuf,
    reply: oneshot::Sender<bool>,
  },
  Status(oneshot::Sender<Vec<QueueEntry>>),
  Stats(oneshot::Sender<WatcherStats>),
  CachedResult {
    key: String,
    reply: oneshot::Sender<Option<AnalysisOutput>>,
  },
}

/// Handle to communicate with a running WatchQueue
#[derive(Clone, Debug)]
pub struct WatchQueueHandle {
  pub tx: mpsc::Sender<QueueMessage>,
}

impl WatchQueueHandle {
  pub fn new(tx: mpsc::Sender<QueueMessage>) -> Self {
    Self { tx }
  }

  pub async fn enqueue(&self, trigger: Trigger) -> Result<(), WatcherError> {
    self
      .tx
      .send(QueueMessage::Enqueue(trigger))
      .await
      .map_err(|_| WatcherError::QueueClosed)
  }

  /// Drop the pending entry for `path`. Returns false if nothing was queued.
  ///
  /// A running attempt still finishes, but is not retried, reported or cached.
  pub async fn cancel(&self, path: &Path) -> Result<bool, WatcherError> {
    let (reply, rx) = oneshot::channel();
    self.request(QueueMessage::Cancel {
      path: path.to_path_buf(),
      reply,
    })
    .await?;
    rx.await.map_err(|_| WatcherError::QueueClosed)
  }

  pub async fn status(&self) -> Result<Vec<QueueEntry>, WatcherError> {
    let (reply, rx) = oneshot::channel();
    self.request(QueueMessage::Status(reply)).await?;
    rx.await.map_err(|_| WatcherError::QueueClosed)
  }

  pub async fn stats(&self) -> Result<WatcherStats, WatcherError> {
    let (reply, rx) = oneshot::channel();
    self.request(QueueMessage::Stats(reply)).await?;
    rx.await.map_err(|_| WatcherError::QueueClosed)
  }

  /// Last successful output for `key`
  pub async fn cached_result(&self, key: &str) -> Result<Option<AnalysisOutput>, WatcherError> {
    let (reply, rx) = oneshot::channel();
    self
      .request(QueueMessage::CachedResult {
        key: key.to_string(),
        reply,
      })
      .await?;
    rx.await.map_err(|_| WatcherError::QueueClosed)
  }

  async fn request(&self, msg: QueueMessage) -> Result<(), WatcherError> {
    self.tx.send(msg).await.map_err(|_| WatcherError::QueueClosed)
  }
}

// ============================================================================
// WatchQueue
// ============================================================================

#[derive(Debug)]
struct Slot {
  entry: QueueEntry,
  /// Newest event received while the entry was Processing
  parked: Option<ChangeEvent>,
  cancelled: bool,
  seq: u64,
}

pub struct WatchQueue {
  governor: Arc<ConcurrencyGovernor>,
  analyzer: Arc<dyn Analyzer>,
  events: EventDispatcher,
  retry: RetryPolicy,
  rx: mpsc::Receiver<QueueMessage>,
  cancel: CancellationToken,
  slots: HashMap<String, Slot>,
  results: HashMap<String, AnalysisOutput>,
  workers: JoinSet<Execution>,
  /// Key of each spawned worker, so a worker that dies still settles its entry
  worker_keys: HashMap<Id, String>,
  stats: WatcherStats,
  next_seq: u64,
  _lease: MonitorLease,
}

/// Start a WatchQueue and return its handle.
///
/// The queue stops when `cancel` fires or every handle is dropped, then waits
/// for admitted work and resolves to the final stats.
pub fn spawn(
  governor: Arc<ConcurrencyGovernor>,
  monitor: &Arc<ResourceMonitor>,
  analyzer: Arc<dyn Analyzer>,
  events: EventDispatcher,
  retry: RetryPolicy,
  cancel: CancellationToken,
) -> (WatchQueueHandle, JoinHandle<WatcherStats>) {
  let (tx, rx) = mpsc::channel(QUEUE_CHANNEL);
  let queue = WatchQueue {
    governor,
    analyzer,
    events,
    retry,
    rx,
    cancel,
    slots: HashMap::new(),
    results: HashMap::new(),
    workers: JoinSet::new(),
    worker_keys: HashMap::new(),
    stats: WatcherStats::default(),
    next_seq: 0,
    _lease: monitor.lease(),
  };
  let task = tokio::spawn(queue.run());
  (WatchQueueHandle::new(tx), task)
}

impl WatchQueue {
  async fn run(mut self) -> WatcherStats {
    info!(max_retries = self.retry.max_retries, "WatchQueue started");

    loop {
      self.admit_ready();
      let next_retry = self.next_retry();

      tokio::select! {
          biased;

          _ = self.cancel.cancelled() => {
              info!("WatchQueue shutting down (cancelled)");
              break;
          }

          Some(joined) = self.workers.join_next_with_id() => self.joined(joined, false),

          msg = self.rx.recv() => {
              match msg {
                  Some(msg) => self.handle(msg),
                  None => {
                      info!("WatchQueue shutting down (channel closed)");
                      break;
                  }
              }
          }

          _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => {}

          _ = tokio::time::sleep(TICK) => {}
      }
    }

    // Admitted work always finishes; nothing new is started
    let in_flight = self.workers.len();
    if in_flight > 0 {
      debug!(in_flight, "Draining in-flight watch tasks");
    }
    while let Some(joined) = self.workers.join_next_with_id().await {
      self.joined(joined, true);
    }

    self.stats.queue_size = self.slots.len();
    info!(
      processed = self.stats.files_processed,
      errors = self.stats.errors,
      dropped = self.slots.len(),
      "WatchQueue stopped"
    );
    self.stats
  }

  fn handle(&mut self, msg: QueueMessage) {
    match msg {
      QueueMessage::Enqueue(trigger) => self.enqueue(trigger),
      QueueMessage::Cancel { path, reply } => {
        let _ = reply.send(self.cancel_path(&path));
      }
      QueueMessage::Status(reply) => {
        let _ = reply.send(self.status());
      }
      QueueMessage::Stats(reply) => {
        let mut stats = self.stats.clone();
        stats.queue_size = self.slots.len();
        let _ = reply.send(stats);
      }
      QueueMessage::CachedResult { key, reply } => {
        let _ = reply.send(self.results.get(&key).cloned());
      }
    }
  }

  fn enqueue(&mut self, trigger: Trigger) {
    let now = Instant::now();
    let Trigger { event, merged } = trigger;
    let key = event.key();

    self.stats.total_events += 1 + merged;
    self.stats.coalesced_events += merged;

    match self.slots.get_mut(&key) {
      Some(slot) if slot.entry.state == EntryState::Processing => {
        trace!(key = %key, kind = ?event.kind, "Parking event behind running attempt");
        if slot.parked.replace(event).is_some() {
          self.stats.coalesced_events += 1;
        }
        slot.cancelled = false;
      }
      Some(slot) => {
        trace!(key = %key, kind = ?event.kind, "Coalescing queued entry");
        slot.entry.coalesce(event, now);
        slot.entry.state = EntryState::Queued;
        self.stats.coalesced_events += 1;
      }
      None => {
        debug!(key = %key, kind = ?event.kind, "Queued");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(
          key,
          Slot {
            entry: QueueEntry::new(event, now),
            parked: None,
            cancelled: false,
            seq,
          },
        );
      }
    }
    self.stats.queue_size = self.slots.len();
  }

  fn cancel_path(&mut self, path: &Path) -> bool {
    let key = path_key(path);
    let Some(slot) = self.slots.get_mut(&key) else {
      return false;
    };

    if slot.entry.state == EntryState::Processing {
      slot.cancelled = true;
      slot.parked = None;
    } else {
      self.slots.remove(&key);
      self.stats.queue_size = self.slots.len();
    }
    debug!(key = %key, "Entry cancelled");
    true
  }

  fn status(&self) -> Vec<QueueEntry> {
    let mut slots: Vec<&Slot> = self.slots.values().collect();
    slots.sort_by_key(|s| s.seq);
    slots.into_iter().map(|s| s.entry.clone()).collect()
  }

  fn next_retry(&self) -> Option<Instant> {
    self
      .slots
      .values()
      .filter(|s| s.entry.state == EntryState::Retrying)
      .map(|s| s.entry.scheduled_at)
      .min()
  }

  fn admit_ready(&mut self) {
    if self.cancel.is_cancelled() {
      return;
    }

    let now = Instant::now();
    let mut ready: Vec<(u64, String)> = self
      .slots
      .iter()
      .filter(|(_, s)| s.entry.is_ready(now))
      .map(|(k, s)| (s.seq, k.clone()))
      .collect();
    ready.sort_unstable();

    for (_, key) in ready {
      let Some(slot) = self.slots.get_mut(&key) else {
        continue;
      };

      let kind = if slot.entry.latest_event.is_delete() {
        Admission::Removal
      } else if slot.entry.attempt == 0 {
        Admission::Fresh
      } else {
        Admission::Retry
      };

      // Refused entries stay queued for the next wake
      let Ok(permit) = self.governor.try_admit(&key, kind) else {
        continue;
      };

      slot.entry.state = EntryState::Processing;
      debug!(key = %key, attempt = slot.entry.attempt, ?kind, "Watch task admitted");

      let analyzer = Arc::clone(&self.analyzer);
      let worker = match kind {
        Admission::Removal => self.workers.spawn(execute_remove(analyzer, key.clone(), permit)),
        _ => {
          self
            .workers
            .spawn(execute(analyzer, key.clone(), self.governor.limits(), permit))
        }
      };
      self.worker_keys.insert(worker.id(), key);
    }
  }

  fn joined(&mut self, joined: Result<(Id, Execution), JoinError>, draining: bool) {
    match joined {
      Ok((id, exec)) => {
        self.worker_keys.remove(&id);
        self.complete(exec, draining);
      }
      Err(e) => {
        let Some(key) = self.worker_keys.remove(&e.id()) else {
          error!(error = %e, "Unknown watch worker failed");
          return;
        };
        error!(key = %key, error = %e, "Watch worker failed");
        let exec = Execution {
          key,
          outcome: ExecOutcome::Failed(AnalysisError::permanent("analysis task failed")),
          elapsed: Duration::ZERO,
        };
        self.complete(exec, draining);
      }
    }
  }

  fn complete(&mut self, exec: Execution, draining: bool) {
    let Some(slot) = self.slots.get_mut(&exec.key) else {
      error!(key = %exec.key, "Completion for unknown entry");
      return;
    };
    self.stats.record_timing(exec.elapsed);
    let key = exec.key;

    let terminal = match exec.outcome {
      // Cancelled mid-run: the result is neither reported nor cached
      ExecOutcome::Analyzed(_) | ExecOutcome::Skipped { .. } if slot.cancelled => {
        debug!(key = %key, "Discarding result of cancelled entry");
        EntryState::Cancelled
      }
      ExecOutcome::Analyzed(output) => {
        self.stats.files_processed += 1;
        self.events.file_complete(&key, &output);
        self.results.insert(key.clone(), output);
        EntryState::Completed
      }
      ExecOutcome::Skipped { size } => {
        debug!(key = %key, size, "Watched file skipped");
        self.stats.files_skipped += 1;
        EntryState::Completed
      }
      ExecOutcome::Removed => {
        self.stats.deletions += 1;
        self.results.remove(&key);
        EntryState::Completed
      }
      ExecOutcome::Failed(_) if slot.cancelled => EntryState::Cancelled,
      ExecOutcome::Failed(err) => {
        let decision = if slot.parked.is_some() || draining {
          // A newer event supersedes this attempt, or nothing may start
          RetryDecision::GiveUp
        } else {
          self.retry.decide(slot.entry.attempt, &err)
        };

        match decision {
          RetryDecision::Retry { after } => {
            warn!(
              key = %key,
              attempt = slot.entry.attempt + 1,
              delay_ms = after.as_millis() as u64,
              error = %err,
              "Watch analysis failed, retrying"
            );
            slot.entry.attempt += 1;
            slot.entry.scheduled_at = Instant::now() + after;
            slot.entry.state = EntryState::Retrying;
            return;
          }
          RetryDecision::GiveUp if slot.parked.is_some() => EntryState::Cancelled,
          RetryDecision::GiveUp => {
            let attempts = slot.entry.attempt + 1;
            let error = FileError::give_up(attempts, err);
            warn!(key = %key, attempts, error = %error, "Giving up on watched file");
            self.stats.errors += 1;
            self.events.file_error(&key, &error, attempts);
            EntryState::Failed
          }
        }
      }
    };

    trace!(key = %key, state = ?terminal, "Entry finished");

    match slot.parked.take() {
      Some(event) if !draining => {
        slot.entry = QueueEntry::new(event, Instant::now());
        slot.cancelled = false;
        slot.seq = self.next_seq;
        self.next_seq += 1;
      }
      _ => {
        self.slots.remove(&key);
      }
    }
    self.stats.queue_size = self.slots.len();
  }
}

impl std::fmt::Debug for WatchQueue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WatchQueue")
      .field("entries", &self.slots.len())
      .field("in_flight", &self.workers.len())
      .finish_non_exhaustive()
  }
}
