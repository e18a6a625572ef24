// mdhub/src/retry.rs
// Explicit retry schedule for adapters hitting pacing limits or transient
// backend failures. Every policy has an attempt cap; nothing requeues
// forever.

use rand::Rng;
use std::time::Duration;

/// Configuration for adapter retry behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
  /// Delay before the first retry.
  pub initial_delay: Duration,
  /// Multiplier applied per attempt. 1.0 keeps a flat schedule.
  pub backoff_multiplier: f64,
  /// Ceiling for any single delay.
  pub max_delay: Duration,
  /// Total retry attempts before the error is surfaced as terminal.
  pub max_attempts: u32,
  /// Add up to this fraction of random jitter to each delay, avoiding
  /// synchronized retry storms across instruments.
  pub jitter: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    // IB-style pacing violations clear after roughly 20 seconds.
    Self {
      initial_delay: Duration::from_secs(20),
      backoff_multiplier: 2.0,
      max_delay: Duration::from_secs(320),
      max_attempts: 5,
      jitter: 0.1,
    }
  }
}

impl RetryPolicy {
  /// A flat schedule: `attempts` retries of `delay` each.
  pub fn fixed(delay: Duration, attempts: u32) -> Self {
    Self {
      initial_delay: delay,
      backoff_multiplier: 1.0,
      max_delay: delay,
      max_attempts: attempts,
      jitter: 0.0,
    }
  }

  /// No retries: every failure is terminal.
  pub fn none() -> Self {
    Self::fixed(Duration::ZERO, 0)
  }

  /// Delay before retry number `attempt` (1-based), or `None` once the
  /// attempt cap is exhausted.
  pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
    if attempt == 0 || attempt > self.max_attempts {
      return None;
    }
    let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32 - 1);
    let capped = base.min(self.max_delay.as_secs_f64());
    let jittered = if self.jitter > 0.0 {
      capped * (1.0 + rand::rng().random_range(0.0..self.jitter))
    } else {
      capped
    };
    Some(Duration::from_secs_f64(jittered))
  }
}
