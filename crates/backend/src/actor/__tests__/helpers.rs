//! Test helpers for pipeline integration tests.
//!
//! Provides a scripted analyzer, a settable memory probe, a channel-backed
//! change source, and a recorder for dispatcher callbacks.

use std::{
  collections::{HashMap, HashSet},
  path::PathBuf,
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
  actor::{EventDispatcher, MemoryProbe},
  domain::{
    config::PipelineConfig,
    outcome::{AnalysisError, AnalysisOutput},
    task::ChangeEvent,
  },
  external::{Analyzer, ChangeSource, ChangeStream, WatcherError},
  pipeline::Pipeline,
};

// ============================================================================
// Scripted Analyzer
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Failure {
  Always,
  Permanent,
  Times(u32),
}

/// Analyzer whose behavior per key is configured up front.
///
/// Tracks attempts per key, the peak number of concurrent calls, and whether
/// two calls for the same key ever overlapped.
#[derive(Default)]
pub struct ScriptedAnalyzer {
  delay: Duration,
  failures: HashMap<String, Failure>,
  attempts: Mutex<HashMap<String, u32>>,
  active_keys: Mutex<HashSet<String>>,
  forgotten: Mutex<Vec<String>>,
  forget_panics: bool,
  running: AtomicUsize,
  peak: AtomicUsize,
  calls: AtomicUsize,
  overlapped: AtomicBool,
}

impl ScriptedAnalyzer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  /// Every attempt for `key` fails with a transient error
  pub fn fail_always(mut self, key: impl Into<String>) -> Self {
    self.failures.insert(key.into(), Failure::Always);
    self
  }

  pub fn fail_permanently(mut self, key: impl Into<String>) -> Self {
    self.failures.insert(key.into(), Failure::Permanent);
    self
  }

  /// The first `n` attempts for `key` fail, later ones succeed
  pub fn fail_times(mut self, key: impl Into<String>, n: u32) -> Self {
    self.failures.insert(key.into(), Failure::Times(n));
    self
  }

  /// `forget` records the key and then panics
  pub fn panic_on_forget(mut self) -> Self {
    self.forget_panics = true;
    self
  }

  pub fn attempts(&self, key: &str) -> u32 {
    self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }

  pub fn overlapped(&self) -> bool {
    self.overlapped.load(Ordering::SeqCst)
  }

  pub fn forgotten(&self) -> Vec<String> {
    self.forgotten.lock().unwrap().clone()
  }
}

/// Decrements the running counters even if the call is dropped on timeout
struct CallGuard<'a> {
  analyzer: &'a ScriptedAnalyzer,
  key: String,
}

impl Drop for CallGuard<'_> {
  fn drop(&mut self) {
    self.analyzer.running.fetch_sub(1, Ordering::SeqCst);
    self.analyzer.active_keys.lock().unwrap().remove(&self.key);
  }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
  async fn analyze(&self, key: &str) -> Result<AnalysisOutput, AnalysisError> {
    let attempt = {
      let mut attempts = self.attempts.lock().unwrap();
      let n = attempts.entry(key.to_string()).or_insert(0);
      *n += 1;
      *n
    };
    self.calls.fetch_add(1, Ordering::SeqCst);

    if !self.active_keys.lock().unwrap().insert(key.to_string()) {
      self.overlapped.store(true, Ordering::SeqCst);
    }
    let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now_running, Ordering::SeqCst);
    let _guard = CallGuard {
      analyzer: self,
      key: key.to_string(),
    };

    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }

    match self.failures.get(key) {
      Some(Failure::Always) => Err(AnalysisError::transient(format!("{key} is flaky"))),
      Some(Failure::Permanent) => Err(AnalysisError::permanent(format!("{key} cannot be parsed"))),
      Some(Failure::Times(n)) if attempt <= *n => Err(AnalysisError::transient("not yet")),
      _ => Ok(serde_json::json!({ "key": key, "attempt": attempt })),
    }
  }

  async fn forget(&self, key: &str) {
    self.forgotten.lock().unwrap().push(key.to_string());
    if self.forget_panics {
      panic!("forget failed for {key}");
    }
  }
}

// ============================================================================
// Memory Probe
// ============================================================================

/// Memory probe reporting whatever the test sets
#[derive(Clone, Default)]
pub struct StaticProbe(Arc<AtomicU64>);

impl StaticProbe {
  pub fn new(mb: u64) -> Self {
    Self(Arc::new(AtomicU64::new(mb)))
  }

  pub fn set(&self, mb: u64) {
    self.0.store(mb, Ordering::SeqCst);
  }
}

impl MemoryProbe for StaticProbe {
  fn used_mb(&self) -> Option<u64> {
    Some(self.0.load(Ordering::SeqCst))
  }
}

// ============================================================================
// Change Source
// ============================================================================

pub type ChangeSender = mpsc::Sender<Result<ChangeEvent, WatcherError>>;

/// Change source fed by the test through a channel. Can be watched once.
pub struct ChannelSource {
  rx: Mutex<Option<mpsc::Receiver<Result<ChangeEvent, WatcherError>>>>,
}

pub fn channel_source() -> (ChannelSource, ChangeSender) {
  let (tx, rx) = mpsc::channel(64);
  let source = ChannelSource {
    rx: Mutex::new(Some(rx)),
  };
  (source, tx)
}

impl ChangeSource for ChannelSource {
  fn watch(&self, _paths: &[PathBuf]) -> Result<ChangeStream, WatcherError> {
    let rx = self
      .rx
      .lock()
      .unwrap()
      .take()
      .ok_or_else(|| WatcherError::Init("channel source already used".into()))?;
    Ok(ChangeStream::new(rx, None))
  }
}

// ============================================================================
// Event Recorder
// ============================================================================

/// Collects everything the dispatcher reports
#[derive(Default)]
pub struct Recorder {
  pub progress: Mutex<Vec<(usize, usize)>>,
  pub completed: Mutex<Vec<String>>,
  pub errors: Mutex<Vec<(String, u32)>>,
  pub warnings: AtomicUsize,
  pub watcher_errors: Mutex<Vec<String>>,
}

impl Recorder {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn dispatcher(self: &Arc<Self>) -> EventDispatcher {
    let (p, c, e, w, we) = (self.clone(), self.clone(), self.clone(), self.clone(), self.clone());
    EventDispatcher::new()
      .on_progress(move |done, total| p.progress.lock().unwrap().push((done, total)))
      .on_file_complete(move |key, _| c.completed.lock().unwrap().push(key.to_string()))
      .on_file_error(move |key, _, attempts| e.errors.lock().unwrap().push((key.to_string(), attempts)))
      .on_resource_warning(move |_| {
        w.warnings.fetch_add(1, Ordering::SeqCst);
      })
      .on_watcher_error(move |err| we.watcher_errors.lock().unwrap().push(err.to_string()))
  }

  pub fn completed(&self) -> Vec<String> {
    self.completed.lock().unwrap().clone()
  }

  pub fn errors(&self) -> Vec<(String, u32)> {
    self.errors.lock().unwrap().clone()
  }

  pub fn last_progress(&self) -> Option<(usize, usize)> {
    self.progress.lock().unwrap().last().copied()
  }
}

// ============================================================================
// Pipeline Setup
// ============================================================================

/// Config with fast timers and a memory limit no test process reaches
pub fn test_config() -> PipelineConfig {
  PipelineConfig {
    memory_limit_mb: 1_000_000,
    retry_delay_ms: 0,
    debounce_delay_ms: 50,
    monitor_interval_ms: 20,
    ..Default::default()
  }
}

pub struct TestPipeline {
  pub pipeline: Arc<Pipeline>,
  pub analyzer: Arc<ScriptedAnalyzer>,
  pub probe: StaticProbe,
  pub recorder: Arc<Recorder>,
  pub changes: ChangeSender,
}

impl TestPipeline {
  pub fn new(config: PipelineConfig, analyzer: ScriptedAnalyzer) -> Self {
    let analyzer = Arc::new(analyzer);
    let probe = StaticProbe::new(100);
    let recorder = Recorder::new();
    let (source, changes) = channel_source();

    let pipeline = Pipeline::builder(analyzer.clone())
      .config(config)
      .probe(Arc::new(probe.clone()))
      .source(Arc::new(source))
      .events(recorder.dispatcher())
      .build();

    Self {
      pipeline: Arc::new(pipeline),
      analyzer,
      probe,
      recorder,
      changes,
    }
  }

  pub async fn send(&self, event: ChangeEvent) {
    self.changes.send(Ok(event)).await.expect("watcher stream open");
  }
}

/// Wait for a condition to become true, with timeout.
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
  F: FnMut() -> bool,
{
  let start = std::time::Instant::now();
  let poll_interval = Duration::from_millis(10);

  while start.elapsed() < timeout {
    if check() {
      return true;
    }
    tokio::time::sleep(poll_interval).await;
  }

  check()
}

pub fn keys(names: &[&str]) -> Vec<String> {
  names.iter().map(|s| s.to_string()).collect()
}
