//! depflow - a concurrency-governed source analysis pipeline
//!
//! Files are analyzed in bulk ([`Pipeline::process_batch`],
//! [`Pipeline::process_directory`]) or incrementally as they change
//! ([`Pipeline::start_watching`]). Both paths share one admission governor,
//! so resource bounds and the one-task-per-file rule hold across them.
//!
//! The per-file analysis itself is supplied by the caller through the
//! [`external::Analyzer`] trait.

mod actor;
mod pipeline;

pub mod domain;
pub mod external;
pub mod logging;

pub use actor::{
  Admission, AdmissionPermit, BatchOptions, BatchResult, ChangeDebouncer, ConcurrencyGovernor, EventDispatcher,
  MemoryProbe, ProcessMemoryProbe, Recorded, Refusal, ResourceSnapshot, ResourceState, RetryDecision, RetryPolicy,
  RunFailure, Trigger,
};
pub use domain::config;
pub use pipeline::{Pipeline, PipelineBuilder, PipelineError};
