//! ConcurrencyGovernor - admission control shared by batch and watch work
//!
//! The governor bounds how many analysis calls run at once and guarantees at
//! most one in-flight task per key across every coordinator that shares it.
//!
//! # Effective bound
//!
//! ```text
//! normal:   priority.bias(limits.max_concurrency)
//! critical: 1, and fresh admissions are refused outright
//! ```
//!
//! Admission is non-blocking: callers that are refused keep the task pending
//! and try again on their next scheduling tick. Limit changes are read by
//! every later admission and never touch work that was already admitted.

use std::sync::{
  Arc,
  atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::domain::config::{Priority, ResourceLimits};

/// What kind of work is asking for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  /// First attempt of a task
  Fresh,
  /// A retry of work that was admitted before
  Retry,
  /// Cache removal for a deleted file; takes no slot but still owns the key
  Removal,
}

/// Why an admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Refusal {
  #[error("all slots are in use")]
  AtCapacity,
  #[error("key is already in flight")]
  KeyInFlight,
  #[error("memory is above the limit")]
  ResourceCritical,
}

/// Admission limiter shared by all coordinators
#[derive(Debug)]
pub struct ConcurrencyGovernor {
  limits: watch::Sender<ResourceLimits>,
  priority: watch::Sender<Priority>,
  critical: AtomicBool,
  running: AtomicUsize,
  in_flight: DashMap<String, Admission>,
  completed: AtomicU64,
}

impl ConcurrencyGovernor {
  pub fn new(limits: ResourceLimits, priority: Priority) -> Self {
    Self {
      limits: watch::Sender::new(limits),
      priority: watch::Sender::new(priority),
      critical: AtomicBool::new(false),
      running: AtomicUsize::new(0),
      in_flight: DashMap::new(),
      completed: AtomicU64::new(0),
    }
  }

  /// Try to admit work for `key` without waiting.
  ///
  /// On success the returned permit holds the slot and the key until it is
  /// released or dropped.
  pub fn try_admit(self: &Arc<Self>, key: &str, kind: Admission) -> Result<AdmissionPermit, Refusal> {
    if kind == Admission::Fresh && self.is_critical() {
      trace!(key, "Admission refused (resource critical)");
      return Err(Refusal::ResourceCritical);
    }

    let counted = kind != Admission::Removal;

    match self.in_flight.entry(key.to_string()) {
      Entry::Occupied(_) => {
        trace!(key, "Admission refused (key in flight)");
        Err(Refusal::KeyInFlight)
      }
      Entry::Vacant(slot) => {
        if counted {
          let bound = self.effective_concurrency();
          let mut current = self.running.load(Ordering::Acquire);
          loop {
            if current >= bound {
              trace!(key, running = current, bound, "Admission refused (at capacity)");
              return Err(Refusal::AtCapacity);
            }
            match self
              .running
              .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
              Ok(_) => break,
              Err(actual) => current = actual,
            }
          }
        }

        slot.insert(kind);
        trace!(key, ?kind, "Admitted");
        Ok(AdmissionPermit {
          governor: Arc::clone(self),
          key: key.to_string(),
          counted,
          released: false,
        })
      }
    }
  }

  fn release_key(&self, key: &str, counted: bool) {
    self.in_flight.remove(key);
    if counted {
      self.running.fetch_sub(1, Ordering::AcqRel);
      self.completed.fetch_add(1, Ordering::Relaxed);
    }
  }

  /// The bound applied to the next admission
  pub fn effective_concurrency(&self) -> usize {
    if self.is_critical() {
      return 1;
    }
    let configured = self.limits.borrow().max_concurrency;
    self.priority.borrow().bias(configured)
  }

  /// Replace the limits; applies to subsequently admitted tasks only
  pub fn set_limits(&self, limits: ResourceLimits) {
    let previous = self.limits.send_replace(limits);
    if previous != limits {
      info!(
        max_concurrency = limits.max_concurrency,
        max_memory_mb = limits.max_memory_mb,
        timeout_ms = limits.timeout_ms,
        "Resource limits updated"
      );
    }
  }

  pub fn limits(&self) -> ResourceLimits {
    *self.limits.borrow()
  }

  pub fn set_priority(&self, priority: Priority) {
    let previous = self.priority.send_replace(priority);
    if previous != priority {
      debug!(?priority, "Priority updated");
    }
  }

  pub fn priority(&self) -> Priority {
    *self.priority.borrow()
  }

  /// Flag set by the resource monitor while memory is above the limit
  pub fn set_critical(&self, critical: bool) {
    let previous = self.critical.swap(critical, Ordering::AcqRel);
    if previous != critical {
      if critical {
        warn!("Memory above limit, refusing new admissions");
      } else {
        info!("Memory back under limit, resuming admissions");
      }
    }
  }

  pub fn is_critical(&self) -> bool {
    self.critical.load(Ordering::Acquire)
  }

  /// Number of slot-holding tasks currently running
  pub fn running(&self) -> usize {
    self.running.load(Ordering::Acquire)
  }

  pub fn is_in_flight(&self, key: &str) -> bool {
    self.in_flight.contains_key(key)
  }

  /// Total slot-holding tasks released since creation
  pub fn completed(&self) -> u64 {
    self.completed.load(Ordering::Relaxed)
  }
}

/// A held admission slot. Releases on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
  governor: Arc<ConcurrencyGovernor>,
  key: String,
  counted: bool,
  released: bool,
}

impl AdmissionPermit {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Give the slot and key back to the governor
  pub fn release(mut self) {
    self.release_inner();
  }

  fn release_inner(&mut self) {
    if !self.released {
      self.released = true;
      self.governor.release_key(&self.key, self.counted);
    }
  }
}

impl Drop for AdmissionPermit {
  fn drop(&mut self) {
    self.release_inner();
  }
}
