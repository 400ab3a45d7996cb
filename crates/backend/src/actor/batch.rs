//! BatchCoordinator - drives a fixed key set through the governor
//!
//! One coordinator call owns one [`BatchRun`]. The run loop is the only
//! writer of task state; workers report back through a `JoinSet`.
//!
//! # Scheduling
//!
//! The loop wakes on a worker completion, a retry timer, cancellation, or a
//! periodic tick, and on every wake:
//!
//! 1. moves Retrying tasks whose delay elapsed back to Pending
//! 2. observes cancellation and the critical resource state
//! 3. admits ready Pending tasks in insertion order until refused
//!
//! Admission is opportunistic: a refused task stays Pending and is tried again
//! on the next wake. Cancellation and aborts stop admissions only; admitted
//! work always finishes.

use std::{
  collections::{BTreeMap, HashMap, HashSet},
  sync::Arc,
  time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
  events::EventDispatcher,
  executor::{ExecOutcome, Execution, execute},
  governor::{Admission, ConcurrencyGovernor, Refusal},
  monitor::ResourceMonitor,
  retry::{RetryDecision, RetryPolicy},
};
use crate::{
  domain::{
    config::PipelineConfig,
    outcome::{AnalysisError, AnalysisOutput, FailedFile, FileError, RunError},
    stats::BatchStats,
    task::{AnalysisTask, TaskState},
  },
  external::Analyzer,
};

const DEFAULT_TICK: Duration = Duration::from_millis(10);

// ============================================================================
// Options & Results
// ============================================================================

/// Per-run settings
#[derive(Debug, Clone)]
pub struct BatchOptions {
  /// Extra cap on this run's running tasks, below the governor's bound
  pub max_concurrency: Option<usize>,
  /// Keep going after a file gives up (default: true)
  pub continue_on_error: bool,
  pub retry: RetryPolicy,
  /// Upper bound on how long a refused task waits before admission is retried
  pub tick: Duration,
}

impl Default for BatchOptions {
  fn default() -> Self {
    Self::from_config(&PipelineConfig::default())
  }
}

impl BatchOptions {
  pub fn from_config(config: &PipelineConfig) -> Self {
    Self {
      max_concurrency: None,
      continue_on_error: config.continue_on_error,
      retry: RetryPolicy::from_config(config),
      tick: DEFAULT_TICK,
    }
  }

  pub fn with_max_concurrency(mut self, max: usize) -> Self {
    self.max_concurrency = Some(max.max(1));
    self
  }

  pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
    self.continue_on_error = continue_on_error;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }
}

/// Outcome of one batch run. Lists are in key insertion order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
  pub run_id: Uuid,
  pub succeeded: Vec<String>,
  pub failed: Vec<FailedFile>,
  pub skipped: Vec<String>,
  /// Analyzer output per succeeded key
  pub outputs: BTreeMap<String, AnalysisOutput>,
  pub cancelled: bool,
  /// Run-level condition that stopped admissions early
  #[serde(serialize_with = "serialize_run_error")]
  pub aborted: Option<RunError>,
  pub stats: BatchStats,
  pub started_at: DateTime<Utc>,
  pub ended_at: DateTime<Utc>,
}

fn serialize_run_error<S: serde::Serializer>(e: &Option<RunError>, s: S) -> Result<S::Ok, S::Error> {
  match e {
    Some(e) => s.collect_str(e),
    None => s.serialize_none(),
  }
}

impl BatchResult {
  /// True when every task reached a terminal state without a run-level stop
  pub fn is_complete(&self) -> bool {
    !self.cancelled && self.aborted.is_none()
  }

  /// Treat a cancelled or aborted run as an error carrying the partial result
  pub fn into_result(self) -> Result<BatchResult, RunFailure> {
    match self.aborted.clone() {
      Some(error) => Err(RunFailure {
        error,
        partial: Box::new(self),
      }),
      None => Ok(self),
    }
  }
}

/// A run that stopped early, with whatever it finished
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
  pub error: RunError,
  pub partial: Box<BatchResult>,
}

// ============================================================================
// BatchRun
// ============================================================================

/// Mutable state of a single run, owned by the run loop
struct BatchRun {
  id: Uuid,
  tasks: Vec<AnalysisTask>,
  index: HashMap<String, usize>,
  succeeded: Vec<usize>,
  failed: Vec<(usize, FailedFile)>,
  skipped: Vec<usize>,
  outputs: BTreeMap<String, AnalysisOutput>,
  stats: BatchStats,
  running: usize,
  terminal: usize,
  admitting: bool,
  cancelled: bool,
  aborted: Option<RunError>,
  started_at: DateTime<Utc>,
}

impl BatchRun {
  fn new(id: Uuid, keys: Vec<String>, now: Instant) -> Self {
    let mut seen = HashSet::new();
    let tasks: Vec<AnalysisTask> = keys
      .into_iter()
      .filter(|k| seen.insert(k.clone()))
      .map(|k| AnalysisTask::new(k, now))
      .collect();
    let index = tasks.iter().enumerate().map(|(i, t)| (t.key.clone(), i)).collect();
    let stats = BatchStats::new(tasks.len());

    Self {
      id,
      tasks,
      index,
      succeeded: Vec::new(),
      failed: Vec::new(),
      skipped: Vec::new(),
      outputs: BTreeMap::new(),
      stats,
      running: 0,
      terminal: 0,
      admitting: true,
      cancelled: false,
      aborted: None,
      started_at: Utc::now(),
    }
  }

  fn total(&self) -> usize {
    self.tasks.len()
  }

  fn wake_retries(&mut self, now: Instant) {
    for task in &mut self.tasks {
      if task.wake(now) {
        trace!(run_id = %self.id, key = %task.key, attempt = task.attempt, "Retry ready");
      }
    }
  }

  fn has_outstanding(&self) -> bool {
    self
      .tasks
      .iter()
      .any(|t| matches!(t.state, TaskState::Pending | TaskState::Retrying))
  }

  fn next_retry(&self) -> Option<Instant> {
    self
      .tasks
      .iter()
      .filter(|t| t.state == TaskState::Retrying)
      .map(|t| t.scheduled_at)
      .min()
  }

  fn stop(&mut self, reason: RunError) {
    self.admitting = false;
    if self.aborted.is_none() {
      self.aborted = Some(reason);
    }
  }

  fn finish(mut self) -> BatchResult {
    for task in &mut self.tasks {
      match task.state {
        TaskState::Pending | TaskState::Retrying => task.state = TaskState::Cancelled,
        TaskState::Running => {
          // Only reachable if a worker was lost without reporting back
          let err = AnalysisError::permanent("worker task failed");
          let attempts = task.attempt + 1;
          task.state = TaskState::Failed;
          let idx = self.index.get(&task.key).copied().unwrap_or(usize::MAX);
          self.failed.push((
            idx,
            FailedFile {
              key: task.key.clone(),
              attempts,
              error: FileError::give_up(attempts, err),
            },
          ));
          self.stats.errors += 1;
        }
        _ => {}
      }
    }

    self.succeeded.sort_unstable();
    self.skipped.sort_unstable();
    self.failed.sort_by_key(|(i, _)| *i);
    self.stats.queue_size = 0;

    let tasks = &self.tasks;
    BatchResult {
      run_id: self.id,
      succeeded: self.succeeded.iter().map(|&i| tasks[i].key.clone()).collect(),
      failed: self.failed.into_iter().map(|(_, f)| f).collect(),
      skipped: self.skipped.iter().map(|&i| tasks[i].key.clone()).collect(),
      outputs: self.outputs,
      cancelled: self.cancelled,
      aborted: self.aborted,
      stats: self.stats,
      started_at: self.started_at,
      ended_at: Utc::now(),
    }
  }
}

// ============================================================================
// BatchCoordinator
// ============================================================================

/// Runs batches against a shared governor and monitor
#[derive(Clone)]
pub struct BatchCoordinator {
  governor: Arc<ConcurrencyGovernor>,
  monitor: Arc<ResourceMonitor>,
  analyzer: Arc<dyn Analyzer>,
  events: EventDispatcher,
}

impl BatchCoordinator {
  pub fn new(
    governor: Arc<ConcurrencyGovernor>,
    monitor: Arc<ResourceMonitor>,
    analyzer: Arc<dyn Analyzer>,
    events: EventDispatcher,
  ) -> Self {
    Self {
      governor,
      monitor,
      analyzer,
      events,
    }
  }

  /// Process `keys` to completion, cancellation, or abort.
  ///
  /// Per-file failures never surface as errors; they are collected in
  /// [`BatchResult::failed`].
  pub async fn run(
    &self,
    run_id: Uuid,
    keys: Vec<String>,
    options: BatchOptions,
    cancel: CancellationToken,
  ) -> BatchResult {
    let _lease = self.monitor.lease();
    let mut run = BatchRun::new(run_id, keys, Instant::now());
    let mut workers: JoinSet<Execution> = JoinSet::new();

    info!(
      run_id = %run.id,
      total = run.total(),
      continue_on_error = options.continue_on_error,
      max_retries = options.retry.max_retries,
      "Batch run started"
    );

    loop {
      run.wake_retries(Instant::now());

      if !run.cancelled && cancel.is_cancelled() {
        info!(run_id = %run.id, "Batch run cancelled, finishing running tasks");
        run.cancelled = true;
        run.stop(RunError::Cancelled);
      }

      if run.admitting && !options.continue_on_error && self.governor.is_critical() {
        let snapshot = self.monitor.latest();
        let reason = RunError::ResourceLimitExceeded {
          used_mb: snapshot.memory_used_mb.unwrap_or_default(),
          limit_mb: snapshot.memory_limit_mb,
        };
        warn!(run_id = %run.id, error = %reason, "Aborting batch run");
        run.stop(reason);
      }

      if run.admitting {
        self.admit_ready(&mut run, &mut workers, &options, &cancel);
      }

      run.stats.queue_size = run.total() - run.terminal - run.running;

      if workers.is_empty() && (!run.admitting || !run.has_outstanding()) {
        break;
      }

      let next_retry = run.next_retry();

      tokio::select! {
          biased;

          _ = cancel.cancelled(), if !run.cancelled => {}

          Some(joined) = workers.join_next() => {
              run.running -= 1;
              match joined {
                  Ok(exec) => self.complete(&mut run, exec, &options),
                  Err(e) => error!(run_id = %run.id, error = %e, "Analysis worker failed"),
              }
          }

          _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => {}

          _ = tokio::time::sleep(options.tick) => {}
      }
    }

    let result = run.finish();

    info!(
      run_id = %result.run_id,
      succeeded = result.succeeded.len(),
      failed = result.failed.len(),
      skipped = result.skipped.len(),
      cancelled = result.cancelled,
      aborted = result.aborted.is_some(),
      "Batch run finished"
    );

    result
  }

  fn admit_ready(
    &self,
    run: &mut BatchRun,
    workers: &mut JoinSet<Execution>,
    options: &BatchOptions,
    cancel: &CancellationToken,
  ) {
    let now = Instant::now();

    for i in 0..run.tasks.len() {
      if options.max_concurrency.is_some_and(|cap| run.running >= cap) {
        break;
      }
      if !run.tasks[i].is_ready(now) {
        continue;
      }
      if cancel.is_cancelled() {
        // Picked up as cancellation at the top of the next iteration
        break;
      }

      let task = &mut run.tasks[i];
      let kind = if task.attempt == 0 {
        Admission::Fresh
      } else {
        Admission::Retry
      };

      match self.governor.try_admit(&task.key, kind) {
        Ok(permit) => {
          task.state = TaskState::Running;
          run.running += 1;
          debug!(run_id = %run.id, key = %task.key, attempt = task.attempt, "Task admitted");
          workers.spawn(execute(
            Arc::clone(&self.analyzer),
            task.key.clone(),
            self.governor.limits(),
            permit,
          ));
        }
        Err(Refusal::KeyInFlight) | Err(Refusal::ResourceCritical) => continue,
        Err(Refusal::AtCapacity) => break,
      }
    }
  }

  fn complete(&self, run: &mut BatchRun, exec: Execution, options: &BatchOptions) {
    let Some(&idx) = run.index.get(&exec.key) else {
      error!(run_id = %run.id, key = %exec.key, "Completion for unknown task");
      return;
    };
    run.stats.record_timing(exec.elapsed);

    let task = &mut run.tasks[idx];

    match exec.outcome {
      ExecOutcome::Analyzed(output) => {
        task.state = TaskState::Succeeded;
        debug!(
          run_id = %run.id,
          key = %task.key,
          elapsed_ms = exec.elapsed.as_millis() as u64,
          "Task succeeded"
        );
        self.events.file_complete(&task.key, &output);
        run.outputs.insert(task.key.clone(), output);
        run.succeeded.push(idx);
        run.stats.files_processed += 1;
      }
      ExecOutcome::Skipped { .. } | ExecOutcome::Removed => {
        task.state = TaskState::Skipped;
        run.skipped.push(idx);
        run.stats.files_skipped += 1;
      }
      ExecOutcome::Failed(err) => match options.retry.decide(task.attempt, &err) {
        RetryDecision::Retry { after } => {
          warn!(
            run_id = %run.id,
            key = %task.key,
            attempt = task.attempt + 1,
            delay_ms = after.as_millis() as u64,
            error = %err,
            "Analysis failed, retrying"
          );
          task.schedule_retry(Instant::now() + after, err);
          run.stats.retries += 1;
          return;
        }
        RetryDecision::GiveUp => {
          let attempts = task.attempt + 1;
          let error = FileError::give_up(attempts, err.clone());
          task.state = TaskState::Failed;
          task.last_error = Some(err);

          warn!(run_id = %run.id, key = %task.key, attempts, error = %error, "Giving up on file");
          self.events.file_error(&task.key, &error, attempts);

          let key = task.key.clone();
          run.failed.push((idx, FailedFile { key: key.clone(), attempts, error }));
          run.stats.files_processed += 1;
          run.stats.errors += 1;

          if !options.continue_on_error && run.admitting {
            warn!(run_id = %run.id, key = %key, "Stopping batch run after failure");
            run.stop(RunError::Aborted { key });
          }
        }
      },
    }

    run.terminal += 1;
    self.events.progress(run.terminal, run.total());
  }
}

impl std::fmt::Debug for BatchCoordinator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BatchCoordinator")
      .field("governor", &self.governor)
      .field("events", &self.events)
      .finish_non_exhaustive()
  }
}
