//! Counters owned by the batch and watch coordinators.

use std::time::Duration;

use serde::Serialize;

/// Incremental mean of processing durations
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunningAverage {
  samples: u64,
  mean_ms: f64,
}

impl RunningAverage {
  pub fn record(&mut self, elapsed: Duration) {
    self.samples += 1;
    let ms = elapsed.as_secs_f64() * 1000.0;
    self.mean_ms += (ms - self.mean_ms) / self.samples as f64;
  }

  pub fn mean_ms(&self) -> f64 {
    self.mean_ms
  }
}

/// Statistics for one batch run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
  pub total_files: usize,
  pub files_processed: usize,
  pub files_skipped: usize,
  pub errors: usize,
  pub retries: usize,
  pub average_processing_ms: f64,
  pub queue_size: usize,
  #[serde(skip)]
  timing: RunningAverage,
}

impl BatchStats {
  pub fn new(total_files: usize) -> Self {
    Self {
      total_files,
      queue_size: total_files,
      ..Default::default()
    }
  }

  pub fn record_timing(&mut self, elapsed: Duration) {
    self.timing.record(elapsed);
    self.average_processing_ms = self.timing.mean_ms();
  }
}

/// Statistics for a watch session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WatcherStats {
  /// Events received from the change source
  pub total_events: u64,
  /// Events merged into an already pending entry
  pub coalesced_events: u64,
  pub files_processed: u64,
  pub files_skipped: u64,
  pub deletions: u64,
  pub errors: u64,
  pub average_processing_ms: f64,
  pub queue_size: usize,
  #[serde(skip)]
  timing: RunningAverage,
}

impl WatcherStats {
  pub fn record_timing(&mut self, elapsed: Duration) {
    self.timing.record(elapsed);
    self.average_processing_ms = self.timing.mean_ms();
  }
}
