//! Pipeline - the public facade
//!
//! A pipeline owns one governor, one resource monitor and one event
//! dispatcher. Batch runs and the watch session all admit through that single
//! governor, so the concurrency bound and the one-task-per-key rule hold
//! across both.
//!
//! # Example
//!
//! ```ignore
//! let pipeline = Pipeline::builder(analyzer)
//!   .config(PipelineConfig::load_for_project(&root))
//!   .events(EventDispatcher::new().on_progress(|done, total| println!("{done}/{total}")))
//!   .build();
//!
//! let result = pipeline.process_directory(&root, pipeline.batch_options()).await?;
//! pipeline.start_watching(&[root]).await?;
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use dashmap::DashMap;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
  actor::{
    BatchCoordinator, BatchOptions, BatchResult, ConcurrencyGovernor, EventDispatcher, MemoryProbe,
    ProcessMemoryProbe, ResourceMonitor, ResourceSnapshot, RetryPolicy, WatchQueueHandle, WatcherTask, spawn_queue,
  },
  domain::{
    config::{PipelineConfig, Priority, ResourceLimits},
    outcome::AnalysisOutput,
    stats::WatcherStats,
    task::{QueueEntry, path_key},
  },
  external::{Analyzer, ChangeSource, FileLister, ListError, NotifySource, PathFilter, WalkLister, WatcherError},
};

/// Errors from run-level setup. Per-file failures never appear here.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
  #[error("Failed to list files: {0}")]
  List(#[from] ListError),
  #[error("Watcher error: {0}")]
  Watcher(#[from] WatcherError),
  #[error("Invalid configuration: {0}")]
  Config(String),
  #[error("Background task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

// ============================================================================
// Builder
// ============================================================================

pub struct PipelineBuilder {
  config: PipelineConfig,
  analyzer: Arc<dyn Analyzer>,
  lister: Arc<dyn FileLister>,
  source: Arc<dyn ChangeSource>,
  probe: Arc<dyn MemoryProbe>,
  events: EventDispatcher,
}

impl PipelineBuilder {
  pub fn config(mut self, config: PipelineConfig) -> Self {
    self.config = config;
    self
  }

  pub fn lister(mut self, lister: Arc<dyn FileLister>) -> Self {
    self.lister = lister;
    self
  }

  pub fn source(mut self, source: Arc<dyn ChangeSource>) -> Self {
    self.source = source;
    self
  }

  pub fn probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
    self.probe = probe;
    self
  }

  pub fn events(mut self, events: EventDispatcher) -> Self {
    self.events = events;
    self
  }

  /// Build the pipeline and start its resource monitor.
  ///
  /// Must be called from within a tokio runtime.
  pub fn build(self) -> Pipeline {
    let governor = Arc::new(ConcurrencyGovernor::new(self.config.limits(), self.config.priority));
    let monitor = Arc::new(ResourceMonitor::new(
      self.probe,
      Arc::clone(&governor),
      self.events.clone(),
      self.config.monitor_interval(),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&monitor).run(shutdown.child_token()));

    let batch = BatchCoordinator::new(
      Arc::clone(&governor),
      Arc::clone(&monitor),
      Arc::clone(&self.analyzer),
      self.events.clone(),
    );

    info!(
      max_concurrency = self.config.max_concurrency,
      memory_limit_mb = self.config.memory_limit_mb,
      priority = ?self.config.priority,
      "Pipeline created"
    );

    Pipeline {
      config: self.config,
      governor,
      monitor,
      analyzer: self.analyzer,
      lister: self.lister,
      source: self.source,
      events: self.events,
      batch,
      runs: DashMap::new(),
      watch: Mutex::new(WatchState::default()),
      shutdown,
    }
  }
}

// ============================================================================
// Pipeline
// ============================================================================

struct WatchSession {
  id: Uuid,
  cancel: CancellationToken,
  queue: WatchQueueHandle,
  queue_task: JoinHandle<WatcherStats>,
  watcher_task: JoinHandle<Result<(), WatcherError>>,
}

#[derive(Default)]
struct WatchState {
  session: Option<WatchSession>,
  /// Final stats of the last stopped session
  last_stats: Option<WatcherStats>,
}

pub struct Pipeline {
  config: PipelineConfig,
  governor: Arc<ConcurrencyGovernor>,
  monitor: Arc<ResourceMonitor>,
  analyzer: Arc<dyn Analyzer>,
  lister: Arc<dyn FileLister>,
  source: Arc<dyn ChangeSource>,
  events: EventDispatcher,
  batch: BatchCoordinator,
  /// Cancellation tokens of active batch runs and the watch session
  runs: DashMap<Uuid, CancellationToken>,
  watch: Mutex<WatchState>,
  shutdown: CancellationToken,
}

impl Pipeline {
  pub fn builder(analyzer: Arc<dyn Analyzer>) -> PipelineBuilder {
    PipelineBuilder {
      config: PipelineConfig::default(),
      analyzer,
      lister: Arc::new(WalkLister::default()),
      source: Arc::new(NotifySource::default()),
      probe: Arc::new(ProcessMemoryProbe),
      events: EventDispatcher::new(),
    }
  }

  /// Pipeline with default collaborators
  pub fn new(config: PipelineConfig, analyzer: Arc<dyn Analyzer>) -> Self {
    Self::builder(analyzer).config(config).build()
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// Batch options derived from the pipeline's config
  pub fn batch_options(&self) -> BatchOptions {
    BatchOptions::from_config(&self.config)
  }

  // --------------------------------------------------------------------------
  // Batch
  // --------------------------------------------------------------------------

  /// Analyze a fixed set of keys under the pipeline's governor
  pub async fn process_batch<I, K>(&self, keys: I, options: BatchOptions) -> BatchResult
  where
    I: IntoIterator<Item = K>,
    K: Into<String>,
  {
    let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
    let id = Uuid::now_v7();
    let cancel = self.shutdown.child_token();

    self.runs.insert(id, cancel.clone());
    let result = self.batch.run(id, keys, options, cancel).await;
    self.runs.remove(&id);

    result
  }

  /// List `root` with the configured patterns and analyze every match
  pub async fn process_directory(&self, root: &Path, options: BatchOptions) -> Result<BatchResult, PipelineError> {
    let lister = Arc::clone(&self.lister);
    let root_buf = root.to_path_buf();
    let patterns = self.config.patterns.clone();
    let exclude = self.config.exclude_patterns.clone();

    let files = tokio::task::spawn_blocking(move || lister.list(&root_buf, &patterns, &exclude)).await??;

    debug!(root = %root.display(), files = files.len(), "Directory resolved");
    let keys: Vec<String> = files.iter().map(|p| path_key(p)).collect();
    Ok(self.process_batch(keys, options).await)
  }

  /// Stop admissions in every active batch run and the watch session.
  ///
  /// Running tasks finish; each run returns its partial result.
  pub fn cancel(&self) {
    let mut cancelled = 0;
    for entry in self.runs.iter() {
      entry.value().cancel();
      cancelled += 1;
    }
    info!(runs = cancelled, "Cancellation requested");
  }

  // --------------------------------------------------------------------------
  // Watch
  // --------------------------------------------------------------------------

  /// Start watching `paths` recursively. Only one session runs at a time.
  pub async fn start_watching(&self, paths: &[PathBuf]) -> Result<(), PipelineError> {
    let mut state = self.watch.lock().await;
    if state.session.as_ref().is_some_and(|s| !s.cancel.is_cancelled()) {
      return Err(WatcherError::AlreadyRunning.into());
    }
    if paths.is_empty() {
      return Err(PipelineError::Config("no paths to watch".to_string()));
    }
    if let Some(stale) = state.session.take() {
      state.last_stats = finish_session(stale).await;
    }

    let filters = paths
      .iter()
      .map(|p| PathFilter::new(p, &self.config.patterns, &self.config.exclude_patterns))
      .collect::<Result<Vec<_>, _>>()?;
    let stream = self.source.watch(paths)?;

    let id = Uuid::now_v7();
    let cancel = self.shutdown.child_token();

    let (queue, queue_task) = spawn_queue(
      Arc::clone(&self.governor),
      &self.monitor,
      Arc::clone(&self.analyzer),
      self.events.clone(),
      RetryPolicy::from_config(&self.config),
      cancel.clone(),
    );

    let watcher = WatcherTask::new(
      stream,
      filters,
      self.config.debounce(),
      queue.clone(),
      self.events.clone(),
      cancel.clone(),
    );

    // A failed watcher takes its queue down with it
    let supervisor = cancel.clone();
    let watcher_task = tokio::spawn(async move {
      let result = watcher.run().await;
      if result.is_err() {
        supervisor.cancel();
      }
      result
    });

    self.runs.insert(id, cancel.clone());
    state.session = Some(WatchSession {
      id,
      cancel,
      queue,
      queue_task,
      watcher_task,
    });

    info!(session = %id, paths = paths.len(), "Watching started");
    Ok(())
  }

  /// Stop the watch session, wait for admitted work, and return its stats
  pub async fn stop_watching(&self) -> Option<WatcherStats> {
    let mut state = self.watch.lock().await;
    let session = state.session.take()?;
    self.runs.remove(&session.id);

    let stats = finish_session(session).await;
    if stats.is_some() {
      state.last_stats = stats.clone();
    }
    stats
  }

  /// True while a watch session is running
  pub async fn is_watching(&self) -> bool {
    let state = self.watch.lock().await;
    state.session.as_ref().is_some_and(|s| !s.cancel.is_cancelled())
  }

  /// Entries currently in the watch queue
  pub async fn queue_status(&self) -> Vec<QueueEntry> {
    let state = self.watch.lock().await;
    match &state.session {
      Some(session) => session.queue.status().await.unwrap_or_default(),
      None => Vec::new(),
    }
  }

  /// Cancel the watch entry for `path`. Returns false if nothing was queued.
  ///
  /// A queued entry is dropped before it runs. A running attempt finishes but
  /// is neither retried nor reported, and its output is not cached.
  pub async fn cancel_path(&self, path: &Path) -> bool {
    let state = self.watch.lock().await;
    match &state.session {
      Some(session) => session.queue.cancel(path).await.unwrap_or(false),
      None => false,
    }
  }

  /// Live stats of the running session, or the final stats of the last one
  pub async fn watcher_stats(&self) -> Option<WatcherStats> {
    let state = self.watch.lock().await;
    if let Some(session) = &state.session
      && let Ok(stats) = session.queue.stats().await
    {
      return Some(stats);
    }
    state.last_stats.clone()
  }

  /// Last successful watch output for `key`
  pub async fn cached_result(&self, key: &str) -> Option<AnalysisOutput> {
    let state = self.watch.lock().await;
    let session = state.session.as_ref()?;
    session.queue.cached_result(key).await.ok().flatten()
  }

  // --------------------------------------------------------------------------
  // Resources
  // --------------------------------------------------------------------------

  pub fn resource_metrics(&self) -> ResourceSnapshot {
    self.monitor.latest()
  }

  /// Replace resource limits for subsequently admitted tasks.
  ///
  /// Memory state is reclassified against the new limit right away.
  pub fn set_resource_limits(&self, limits: ResourceLimits) {
    self.governor.set_limits(limits);
    self.monitor.sample();
  }

  pub fn resource_limits(&self) -> ResourceLimits {
    self.governor.limits()
  }

  pub fn set_priority(&self, priority: Priority) {
    self.governor.set_priority(priority);
  }

  /// Cancel everything and wait for the watch session to stop
  pub async fn shutdown(&self) {
    self.cancel();
    self.stop_watching().await;
    self.shutdown.cancel();
    info!("Pipeline shut down");
  }
}

async fn finish_session(session: WatchSession) -> Option<WatcherStats> {
  session.cancel.cancel();

  match session.watcher_task.await {
    Ok(Ok(())) => {}
    Ok(Err(e)) => debug!(error = %e, "Watcher had stopped with an error"),
    Err(e) => error!(error = %e, "Watcher task panicked"),
  }

  match session.queue_task.await {
    Ok(stats) => {
      info!(session = %session.id, processed = stats.files_processed, "Watching stopped");
      Some(stats)
    }
    Err(e) => {
      warn!(error = %e, "Watch queue task failed");
      None
    }
  }
}

impl Drop for Pipeline {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}

impl std::fmt::Debug for Pipeline {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Pipeline")
      .field("config", &self.config)
      .field("governor", &self.governor)
      .field("active_runs", &self.runs.len())
      .finish_non_exhaustive()
  }
}
