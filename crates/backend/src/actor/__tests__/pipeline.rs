//! Pipeline facade tests: resource controls and setup errors

#[cfg(test)]
mod tests {
  use std::{path::PathBuf, time::Duration};

  use crate::{
    actor::{
      __tests__::helpers::{ScriptedAnalyzer, TestPipeline, test_config},
      BatchOptions, ResourceState,
    },
    domain::config::{PipelineConfig, Priority, ResourceLimits},
    pipeline::PipelineError,
  };

  #[tokio::test]
  async fn test_resource_metrics_reflect_probe_and_limits() {
    let t = TestPipeline::new(test_config(), ScriptedAnalyzer::new());

    let snapshot = t.pipeline.resource_metrics();
    assert_eq!(snapshot.memory_used_mb, Some(100));
    assert_eq!(snapshot.state, ResourceState::Normal);
    assert_eq!(snapshot.concurrency_in_effect, 3);

    t.pipeline.set_resource_limits(ResourceLimits {
      max_memory_mb: 110,
      ..t.pipeline.resource_limits()
    });
    let snapshot = t.pipeline.resource_metrics();
    assert_eq!(snapshot.state, ResourceState::Warning);
    assert_eq!(snapshot.memory_limit_mb, 110);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["state"], "warning");
  }

  #[tokio::test]
  async fn test_priority_changes_effective_concurrency() {
    let config = PipelineConfig {
      max_concurrency: 2,
      ..test_config()
    };
    let t = TestPipeline::new(config, ScriptedAnalyzer::new().with_delay(Duration::from_millis(20)));

    t.pipeline.set_priority(Priority::Speed);
    t.pipeline.set_resource_limits(t.pipeline.resource_limits());
    assert_eq!(t.pipeline.resource_metrics().concurrency_in_effect, 4);

    let files: Vec<String> = (0..12).map(|i| format!("f{i}.ts")).collect();
    let result = t.pipeline.process_batch(files, BatchOptions::default()).await;
    assert_eq!(result.succeeded.len(), 12);
    assert!(t.analyzer.peak() <= 4);

    t.pipeline.set_priority(Priority::Memory);
    t.pipeline.set_resource_limits(t.pipeline.resource_limits());
    assert_eq!(t.pipeline.resource_metrics().concurrency_in_effect, 1);
  }

  #[tokio::test]
  async fn test_lowered_limit_applies_to_later_admissions() {
    let config = PipelineConfig {
      max_concurrency: 4,
      ..test_config()
    };
    let t = TestPipeline::new(config, ScriptedAnalyzer::new().with_delay(Duration::from_millis(10)));

    t.pipeline.set_resource_limits(ResourceLimits {
      max_concurrency: 1,
      ..t.pipeline.resource_limits()
    });
    let files: Vec<String> = (0..6).map(|i| format!("f{i}.ts")).collect();
    let result = t.pipeline.process_batch(files, BatchOptions::default()).await;

    assert_eq!(result.succeeded.len(), 6);
    assert_eq!(t.analyzer.peak(), 1);
  }

  #[tokio::test]
  async fn test_process_directory_rejects_missing_root() {
    let t = TestPipeline::new(test_config(), ScriptedAnalyzer::new());
    let err = t
      .pipeline
      .process_directory(&PathBuf::from("/definitely/not/a/dir"), BatchOptions::default())
      .await
      .unwrap_err();
    assert!(matches!(err, PipelineError::List(_)));
  }

  #[tokio::test]
  async fn test_start_watching_requires_paths() {
    let t = TestPipeline::new(test_config(), ScriptedAnalyzer::new());
    let err = t.pipeline.start_watching(&[]).await.unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
    assert!(!t.pipeline.is_watching().await);
    assert!(t.pipeline.watcher_stats().await.is_none());
    assert!(t.pipeline.queue_status().await.is_empty());
  }

  #[tokio::test]
  async fn test_shutdown_stops_watching() {
    let t = TestPipeline::new(test_config(), ScriptedAnalyzer::new());
    let root = tempfile::TempDir::new().unwrap();
    t.pipeline.start_watching(&[root.path().to_path_buf()]).await.unwrap();
    assert!(t.pipeline.is_watching().await);

    t.pipeline.shutdown().await;
    assert!(!t.pipeline.is_watching().await);
    assert!(t.pipeline.watcher_stats().await.is_some());
  }
}
