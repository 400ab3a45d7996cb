//! Governed execution: admission, monitoring, retries, batch and watch
//!
//! # Architecture
//!
//! - One [`ConcurrencyGovernor`] bounds running analysis calls and owns the
//!   in-flight key registry shared by every coordinator
//! - The [`ResourceMonitor`] samples memory while work is active and flips the
//!   governor into its critical mode
//! - [`BatchCoordinator`] and the watch queue each own their task state in a
//!   single loop; workers report back through a `JoinSet`
//! - The watcher feeds the queue through a per-path debouncer
//!
//! ```text
//! keys ───────────▶ BatchCoordinator ─┐
//!                                      ├─▶ governor ─▶ executor ─▶ Analyzer
//! ChangeSource ─▶ WatcherTask ─▶ WatchQueue ─┘
//! ```

mod batch;
mod debounce;
mod events;
mod executor;
mod governor;
mod monitor;
mod queue;
mod retry;
mod watcher;

#[cfg(test)]
mod __tests__;

pub use batch::{BatchCoordinator, BatchOptions, BatchResult, RunFailure};
pub use debounce::{ChangeDebouncer, Recorded, Trigger};
pub use events::EventDispatcher;
pub use governor::{Admission, AdmissionPermit, ConcurrencyGovernor, Refusal};
pub use monitor::{MemoryProbe, MonitorLease, ProcessMemoryProbe, ResourceMonitor, ResourceSnapshot, ResourceState};
pub use queue::{WatchQueueHandle, spawn as spawn_queue};
pub use retry::{RetryDecision, RetryPolicy};
pub use watcher::WatcherTask;
