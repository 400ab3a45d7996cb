//! Batch coordinator integration tests
//!
//! Each test drives a real pipeline with a scripted analyzer and a settable
//! memory probe.

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use pretty_assertions::assert_eq;

  use crate::{
    actor::{
      __tests__::helpers::{ScriptedAnalyzer, TestPipeline, keys, test_config, wait_for},
      BatchOptions, RetryPolicy,
    },
    domain::{
      config::{PipelineConfig, ResourceLimits},
      outcome::{FileError, RunError},
    },
  };

  #[tokio::test]
  async fn test_transient_failure_retried_then_reported() {
    let config = PipelineConfig {
      max_concurrency: 1,
      ..test_config()
    };
    let t = TestPipeline::new(config, ScriptedAnalyzer::new().fail_always("b.ts"));
    let options = BatchOptions::default().with_retry(RetryPolicy::fixed(2, Duration::ZERO));

    let result = t.pipeline.process_batch(["a.ts", "b.ts", "c.ts"], options).await;

    assert_eq!(result.succeeded, keys(&["a.ts", "c.ts"]));
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].key, "b.ts");
    assert_eq!(result.failed[0].attempts, 3);
    assert!(matches!(result.failed[0].error, FileError::RetryExhausted { attempts: 3, .. }));
    assert_eq!(t.analyzer.attempts("b.ts"), 3);
    assert_eq!(t.analyzer.peak(), 1);

    assert!(result.is_complete());
    assert_eq!(result.stats.retries, 2);
    assert_eq!(result.stats.errors, 1);
    assert_eq!(t.recorder.errors(), vec![("b.ts".to_string(), 3)]);
    assert_eq!(t.recorder.last_progress(), Some((3, 3)));
  }

  #[tokio::test]
  async fn test_retry_bound_is_max_retries_plus_one() {
    let t = TestPipeline::new(test_config(), ScriptedAnalyzer::new().fail_always("x.ts"));

    for max_retries in [0, 1, 4] {
      let before = t.analyzer.attempts("x.ts");
      let options = BatchOptions::default().with_retry(RetryPolicy::fixed(max_retries, Duration::ZERO));
      let result = t.pipeline.process_batch(["x.ts"], options).await;

      assert_eq!(t.analyzer.attempts("x.ts") - before, max_retries + 1);
      assert_eq!(result.failed[0].attempts, max_retries + 1);
    }
  }

  #[tokio::test]
  async fn test_recovering_file_succeeds() {
    let t = TestPipeline::new(test_config(), ScriptedAnalyzer::new().fail_times("a.ts", 2));
    let options = BatchOptions::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(5)));

    let result = t.pipeline.process_batch(["a.ts"], options).await;

    assert_eq!(result.succeeded, keys(&["a.ts"]));
    assert_eq!(result.outputs["a.ts"]["attempt"], 3);
    assert!(t.recorder.errors().is_empty());
  }

  #[tokio::test]
  async fn test_permanent_failure_not_retried() {
    let t = TestPipeline::new(test_config(), ScriptedAnalyzer::new().fail_permanently("bad.ts"));
    let result = t.pipeline.process_batch(["bad.ts"], BatchOptions::default()).await;

    assert_eq!(t.analyzer.attempts("bad.ts"), 1);
    assert!(matches!(result.failed[0].error, FileError::Permanent { .. }));
  }

  #[tokio::test]
  async fn test_admission_bound_never_exceeded() {
    let config = PipelineConfig {
      max_concurrency: 3,
      ..test_config()
    };
    let t = TestPipeline::new(config, ScriptedAnalyzer::new().with_delay(Duration::from_millis(15)));
    let files: Vec<String> = (0..20).map(|i| format!("f{i}.ts")).collect();

    let result = t.pipeline.process_batch(files.clone(), BatchOptions::default()).await;

    assert_eq!(result.succeeded, files);
    assert_eq!(result.outputs.len(), 20);
    assert!(t.analyzer.peak() <= 3, "peak was {}", t.analyzer.peak());
    assert!(t.analyzer.peak() >= 2);
  }

  #[tokio::test]
  async fn test_per_run_cap_below_governor_bound() {
    let config = PipelineConfig {
      max_concurrency: 8,
      ..test_config()
    };
    let t = TestPipeline::new(config, ScriptedAnalyzer::new().with_delay(Duration::from_millis(10)));
    let files: Vec<String> = (0..10).map(|i| format!("f{i}.ts")).collect();

    let options = BatchOptions::default().with_max_concurrency(2);
    let result = t.pipeline.process_batch(files, options).await;

    assert_eq!(result.succeeded.len(), 10);
    assert!(t.analyzer.peak() <= 2);
  }

  #[tokio::test]
  async fn test_duplicate_keys_collapse() {
    let t = TestPipeline::new(test_config(), ScriptedAnalyzer::new());
    let result = t
      .pipeline
      .process_batch(["a.ts", "b.ts", "a.ts"], BatchOptions::default())
      .await;

    assert_eq!(result.succeeded, keys(&["a.ts", "b.ts"]));
    assert_eq!(result.stats.total_files, 2);
    assert_eq!(t.analyzer.attempts("a.ts"), 1);
  }

  #[tokio::test]
  async fn test_stop_on_first_failure() {
    let config = PipelineConfig {
      max_concurrency: 1,
      ..test_config()
    };
    let t = TestPipeline::new(config, ScriptedAnalyzer::new().fail_permanently("b.ts"));
    let options = BatchOptions::default().with_continue_on_error(false);

    let result = t.pipeline.process_batch(["a.ts", "b.ts", "c.ts"], options).await;

    assert_eq!(result.succeeded, keys(&["a.ts"]));
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.aborted, Some(RunError::Aborted { key: "b.ts".into() }));
    assert!(!result.cancelled);
    assert_eq!(t.analyzer.attempts("c.ts"), 0);

    let failure = result.into_result().unwrap_err();
    assert_eq!(failure.partial.succeeded, keys(&["a.ts"]));
  }

  #[tokio::test]
  async fn test_critical_memory_blocks_admission_until_relieved() {
    let config = PipelineConfig {
      max_concurrency: 2,
      ..test_config()
    };
    let t = TestPipeline::new(config, ScriptedAnalyzer::new().with_delay(Duration::from_millis(50)));

    // Usage (100MB) is above the new limit
    t.pipeline.set_resource_limits(ResourceLimits {
      max_memory_mb: 1,
      ..t.pipeline.resource_limits()
    });

    let pipeline = t.pipeline.clone();
    let run = tokio::spawn(async move { pipeline.process_batch(["a.ts", "b.ts", "c.ts"], BatchOptions::default()).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(t.analyzer.calls(), 0, "nothing admitted while critical");
    assert!(t.recorder.warnings.load(std::sync::atomic::Ordering::SeqCst) > 0);

    t.probe.set(0);
    let result = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();

    assert_eq!(result.succeeded, keys(&["a.ts", "b.ts", "c.ts"]));
    assert!(result.is_complete());
  }

  #[tokio::test]
  async fn test_running_tasks_finish_when_memory_goes_critical() {
    let config = PipelineConfig {
      max_concurrency: 2,
      ..test_config()
    };
    let t = TestPipeline::new(config, ScriptedAnalyzer::new().with_delay(Duration::from_millis(80)));
    let files: Vec<String> = (0..6).map(|i| format!("f{i}.ts")).collect();

    let pipeline = t.pipeline.clone();
    let run = tokio::spawn(async move { pipeline.process_batch(files, BatchOptions::default()).await });

    let analyzer = t.analyzer.clone();
    assert!(wait_for(Duration::from_secs(2), || analyzer.calls() >= 2).await);

    t.probe.set(10_000);
    t.pipeline.set_resource_limits(ResourceLimits {
      max_memory_mb: 100,
      ..t.pipeline.resource_limits()
    });

    // The two admitted tasks complete; nothing new starts
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(t.analyzer.calls(), 2);
    assert_eq!(t.recorder.completed().len(), 2);

    t.probe.set(10);
    let result = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    assert_eq!(result.succeeded.len(), 6);
  }

  #[tokio::test]
  async fn test_critical_memory_aborts_strict_run() {
    let t = TestPipeline::new(test_config(), ScriptedAnalyzer::new());
    t.probe.set(500);
    t.pipeline.set_resource_limits(ResourceLimits {
      max_memory_mb: 100,
      ..t.pipeline.resource_limits()
    });

    let options = BatchOptions::default().with_continue_on_error(false);
    let result = t.pipeline.process_batch(["a.ts", "b.ts"], options).await;

    assert_eq!(
      result.aborted,
      Some(RunError::ResourceLimitExceeded {
        used_mb: 500,
        limit_mb: 100
      })
    );
    assert!(result.succeeded.is_empty());
    assert_eq!(t.analyzer.calls(), 0);
  }

  #[tokio::test]
  async fn test_cancel_returns_partial_result() {
    let config = PipelineConfig {
      max_concurrency: 2,
      ..test_config()
    };
    let t = TestPipeline::new(config, ScriptedAnalyzer::new().with_delay(Duration::from_millis(20)));
    let files: Vec<String> = (0..100).map(|i| format!("f{i:03}.ts")).collect();

    let pipeline = t.pipeline.clone();
    let run = tokio::spawn(async move { pipeline.process_batch(files, BatchOptions::default()).await });

    let analyzer = t.analyzer.clone();
    assert!(wait_for(Duration::from_secs(2), || analyzer.calls() >= 2).await);
    t.pipeline.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    let calls_at_return = t.analyzer.calls();

    assert!(result.cancelled);
    assert_eq!(result.aborted, Some(RunError::Cancelled));
    assert!(result.succeeded.len() + result.failed.len() <= 100);
    assert!(result.succeeded.len() < 20, "only a few tasks finish after cancel");
    assert_eq!(result.succeeded.len(), calls_at_return);

    // Nothing starts after the run returned
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(t.analyzer.calls(), calls_at_return);
  }

  #[tokio::test]
  async fn test_process_directory_applies_patterns_and_size_limit() {
    let temp = tempfile::TempDir::new().unwrap();
    let root = temp.path();
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::create_dir_all(root.join("node_modules/dep")).unwrap();
    std::fs::write(root.join("src/a.ts"), "import b from './b';").unwrap();
    std::fs::write(root.join("src/big.ts"), "x".repeat(4096)).unwrap();
    std::fs::write(root.join("src/notes.md"), "# notes").unwrap();
    std::fs::write(root.join("node_modules/dep/index.js"), "module.exports = 1;").unwrap();

    let config = PipelineConfig {
      max_file_size_bytes: 1024,
      ..test_config()
    };
    let t = TestPipeline::new(config, ScriptedAnalyzer::new());

    let result = t
      .pipeline
      .process_directory(root, t.pipeline.batch_options())
      .await
      .unwrap();

    let a = root.join("src/a.ts").to_string_lossy().into_owned();
    let big = root.join("src/big.ts").to_string_lossy().into_owned();
    assert_eq!(result.succeeded, vec![a]);
    assert_eq!(result.skipped, vec![big.clone()]);
    assert_eq!(result.stats.files_skipped, 1);
    assert_eq!(t.analyzer.attempts(&big), 0);
    assert_eq!(result.stats.total_files, 2);
  }
}
