//! ResourceMonitor - periodic memory sampling and classification
//!
//! The monitor samples process memory on a fixed interval while at least one
//! batch run or watcher holds a [`MonitorLease`]. Each sample is classified
//! against the governor's current memory limit:
//!
//! ```text
//! used <  80% of limit   normal
//! used <= 100% of limit  warning   (observers notified, no action)
//! used >  100% of limit  critical  (governor refuses new admissions)
//! ```
//!
//! The monitor never stops a running task itself.

use std::{
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
  sync::{Notify, watch},
  time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{events::EventDispatcher, governor::ConcurrencyGovernor};

const WARNING_RATIO: f64 = 0.8;

// ============================================================================
// Memory Probes
// ============================================================================

/// Source of the process memory figure
pub trait MemoryProbe: Send + Sync {
  /// Resident memory in MB, if it can be determined
  fn used_mb(&self) -> Option<u64>;
}

/// Reads resident set size from `/proc/self/statm` (Linux only)
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
  fn used_mb(&self) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
      let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
      // Second field is RSS in pages, page size is typically 4KB
      let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
      Some(rss_pages * 4 / 1024)
    }
    #[cfg(not(target_os = "linux"))]
    {
      None
    }
  }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Classification of a memory sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
  Normal,
  Warning,
  Critical,
}

impl ResourceState {
  /// Classify usage against a limit. Unknown usage or a zero limit is normal.
  pub fn classify(used_mb: Option<u64>, limit_mb: u64) -> Self {
    let Some(used) = used_mb else {
      return ResourceState::Normal;
    };
    if limit_mb == 0 {
      return ResourceState::Normal;
    }

    if used > limit_mb {
      ResourceState::Critical
    } else if used as f64 >= limit_mb as f64 * WARNING_RATIO {
      ResourceState::Warning
    } else {
      ResourceState::Normal
    }
  }

  /// True when moving from `previous` into an elevated state
  pub fn escalated_from(self, previous: Option<ResourceState>) -> bool {
    self != ResourceState::Normal && previous != Some(self)
  }
}

/// One immutable resource sample
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
  pub memory_used_mb: Option<u64>,
  pub memory_limit_mb: u64,
  pub timestamp: DateTime<Utc>,
  pub concurrency_in_effect: usize,
  pub in_flight: usize,
  /// Completed analysis calls per second since the previous sample
  pub files_per_second: f64,
  pub state: ResourceState,
  #[serde(skip)]
  completed_total: u64,
  #[serde(skip)]
  taken_at: Instant,
}

// ============================================================================
// ResourceMonitor
// ============================================================================

/// Samples resources and feeds the critical flag to the governor
pub struct ResourceMonitor {
  probe: Arc<dyn MemoryProbe>,
  governor: Arc<ConcurrencyGovernor>,
  events: EventDispatcher,
  interval: Duration,
  latest: watch::Sender<Option<ResourceSnapshot>>,
  leases: AtomicUsize,
  wake: Notify,
}

impl ResourceMonitor {
  pub fn new(
    probe: Arc<dyn MemoryProbe>,
    governor: Arc<ConcurrencyGovernor>,
    events: EventDispatcher,
    interval: Duration,
  ) -> Self {
    Self {
      probe,
      governor,
      events,
      interval,
      latest: watch::Sender::new(None),
      leases: AtomicUsize::new(0),
      wake: Notify::new(),
    }
  }

  /// Take a sample now, classify it and publish it
  pub fn sample(&self) -> ResourceSnapshot {
    let limits = self.governor.limits();
    let used = self.probe.used_mb();
    let state = ResourceState::classify(used, limits.max_memory_mb);

    self.governor.set_critical(state == ResourceState::Critical);

    let now = Instant::now();
    let completed_total = self.governor.completed();
    let (files_per_second, previous) = match self.latest.borrow().as_ref() {
      Some(prev) => {
        let elapsed = now.duration_since(prev.taken_at).as_secs_f64();
        let rate = if elapsed > 0.0 {
          completed_total.saturating_sub(prev.completed_total) as f64 / elapsed
        } else {
          prev.files_per_second
        };
        (rate, Some(prev.state))
      }
      None => (0.0, None),
    };

    let snapshot = ResourceSnapshot {
      memory_used_mb: used,
      memory_limit_mb: limits.max_memory_mb,
      timestamp: Utc::now(),
      concurrency_in_effect: self.governor.effective_concurrency(),
      in_flight: self.governor.running(),
      files_per_second,
      state,
      completed_total,
      taken_at: now,
    };

    trace!(
      memory_used_mb = ?used,
      limit_mb = limits.max_memory_mb,
      ?state,
      "Resource sample"
    );

    if state.escalated_from(previous) {
      warn!(
        memory_used_mb = ?used,
        limit_mb = limits.max_memory_mb,
        ?state,
        "Memory usage high"
      );
    } else if state == ResourceState::Normal && previous.is_some_and(|p| p != ResourceState::Normal) {
      info!(memory_used_mb = ?used, limit_mb = limits.max_memory_mb, "Memory usage back to normal");
    }
    if state != ResourceState::Normal {
      self.events.resource_warning(&snapshot);
    }

    self.latest.send_replace(Some(snapshot.clone()));
    snapshot
  }

  /// The most recent sample, sampling now if none exists yet
  pub fn latest(&self) -> ResourceSnapshot {
    if let Some(snapshot) = self.latest.borrow().clone() {
      return snapshot;
    }
    self.sample()
  }

  /// Mark a run as active. Samples immediately so admission decisions made
  /// right after see fresh data.
  pub fn lease(self: &Arc<Self>) -> MonitorLease {
    if self.leases.fetch_add(1, Ordering::AcqRel) == 0 {
      debug!("Resource monitor activated");
      self.wake.notify_one();
    }
    self.sample();
    MonitorLease {
      monitor: Arc::clone(self),
    }
  }

  pub fn is_active(&self) -> bool {
    self.leases.load(Ordering::Acquire) > 0
  }

  /// Sampling loop; idles while no lease is held
  pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
    info!(interval_ms = self.interval.as_millis() as u64, "ResourceMonitor started");

    loop {
      if !self.is_active() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = self.wake.notified() => continue,
        }
      }

      tokio::select! {
          biased;
          _ = cancel.cancelled() => break,
          _ = tokio::time::sleep(self.interval) => {
              if self.is_active() {
                  self.sample();
              }
          }
      }
    }

    info!("ResourceMonitor stopped");
  }
}

impl std::fmt::Debug for ResourceMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResourceMonitor")
      .field("interval", &self.interval)
      .field("leases", &self.leases.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}

/// Keeps the monitor sampling while held
#[derive(Debug)]
pub struct MonitorLease {
  monitor: Arc<ResourceMonitor>,
}

impl Drop for MonitorLease {
  fn drop(&mut self) {
    if self.monitor.leases.fetch_sub(1, Ordering::AcqRel) == 1 {
      debug!("Resource monitor idle");
    }
  }
}
