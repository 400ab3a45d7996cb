//! Retry decisions for failed analysis attempts.
//!
//! A pure function of the attempt counter and the error; the coordinators own
//! the timers.

use std::time::Duration;

use crate::domain::{
  config::{BackoffStrategy, PipelineConfig},
  outcome::AnalysisError,
};

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  Retry { after: Duration },
  GiveUp,
}

/// Retry configuration for one run or watch session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub max_retries: u32,
  /// Base delay before a retry
  pub delay: Duration,
  pub strategy: BackoffStrategy,
  /// Upper bound for exponential delays
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&PipelineConfig::default())
  }
}

impl RetryPolicy {
  pub fn from_config(config: &PipelineConfig) -> Self {
    Self {
      max_retries: if config.retry_failed_files { config.max_retries } else { 0 },
      delay: Duration::from_millis(config.retry_delay_ms),
      strategy: config.backoff,
      max_delay: Duration::from_millis(config.max_backoff_ms),
    }
  }

  /// Fixed delay between retries
  pub fn fixed(max_retries: u32, delay: Duration) -> Self {
    Self {
      max_retries,
      delay,
      strategy: BackoffStrategy::Fixed,
      max_delay: delay,
    }
  }

  /// Never retry
  pub fn none() -> Self {
    Self::fixed(0, Duration::ZERO)
  }

  /// Decide after attempt number `attempt` (zero-based) failed with `error`
  pub fn decide(&self, attempt: u32, error: &AnalysisError) -> RetryDecision {
    if error.is_permanent() || attempt >= self.max_retries {
      return RetryDecision::GiveUp;
    }
    RetryDecision::Retry {
      after: self.delay_for(attempt),
    }
  }

  /// Delay before the retry that follows attempt `attempt`
  pub fn delay_for(&self, attempt: u32) -> Duration {
    match self.strategy {
      BackoffStrategy::Fixed => self.delay,
      BackoffStrategy::Exponential => {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.delay.saturating_mul(factor).min(self.max_delay.max(self.delay))
      }
    }
  }
}
