//! Per-path trailing-edge debouncing of change events.
//!
//! The debouncer is a deadline table. It owns no timers: the caller passes
//! `now` into every operation and asks [`ChangeDebouncer::next_deadline`] when
//! to come back.
//!
//! - Created/Modified restart the path's quiet window and keep the newest event
//! - Deleted drops any pending deadline and fires immediately

use std::{collections::HashMap, path::PathBuf, time::Duration};

use tokio::time::Instant;
use tracing::trace;

use crate::domain::task::ChangeEvent;

/// An event whose quiet window elapsed (or a deletion)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
  pub event: ChangeEvent,
  /// Earlier events for the same path folded into this one
  pub merged: u64,
}

/// What happened to a recorded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
  /// First pending event for the path
  Deferred,
  /// Replaced a pending event and restarted its window
  Coalesced,
  /// Fires now without waiting
  Immediate(Trigger),
}

#[derive(Debug)]
struct Pending {
  event: ChangeEvent,
  deadline: Instant,
  merged: u64,
}

#[derive(Debug)]
pub struct ChangeDebouncer {
  delay: Duration,
  pending: HashMap<PathBuf, Pending>,
}

impl ChangeDebouncer {
  pub fn new(delay: Duration) -> Self {
    Self {
      delay,
      pending: HashMap::new(),
    }
  }

  pub fn record(&mut self, event: ChangeEvent, now: Instant) -> Recorded {
    if event.is_delete() {
      let merged = match self.pending.remove(&event.path) {
        Some(prev) => prev.merged + 1,
        None => 0,
      };
      trace!(path = %event.path.display(), merged, "Deletion bypasses debounce");
      return Recorded::Immediate(Trigger { event, merged });
    }

    let deadline = now + self.delay;
    match self.pending.get_mut(&event.path) {
      Some(pending) => {
        pending.event = event;
        pending.deadline = deadline;
        pending.merged += 1;
        Recorded::Coalesced
      }
      None => {
        self.pending.insert(
          event.path.clone(),
          Pending {
            event,
            deadline,
            merged: 0,
          },
        );
        Recorded::Deferred
      }
    }
  }

  /// Remove and return every event whose deadline is at or before `now`,
  /// earliest deadline first
  pub fn due(&mut self, now: Instant) -> Vec<Trigger> {
    let settled: Vec<PathBuf> = self
      .pending
      .iter()
      .filter(|(_, p)| p.deadline <= now)
      .map(|(path, _)| path.clone())
      .collect();

    let mut fired: Vec<(Instant, Trigger)> = settled
      .into_iter()
      .filter_map(|path| self.pending.remove(&path))
      .map(|p| {
        (
          p.deadline,
          Trigger {
            event: p.event,
            merged: p.merged,
          },
        )
      })
      .collect();

    fired.sort_by_key(|(deadline, _)| *deadline);
    fired.into_iter().map(|(_, t)| t).collect()
  }

  /// Earliest pending deadline, if any
  pub fn next_deadline(&self) -> Option<Instant> {
    self.pending.values().map(|p| p.deadline).min()
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }
}
