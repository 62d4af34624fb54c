use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for transient executor and repository failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exp);
        Duration::from_millis((ms as u64).min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// What happens to the rest of the graph once a node fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorHandling {
    /// Cancel in-flight work and return as soon as the root fails.
    Abort,
    /// Stop dispatching, wait for in-flight work to finish, then return.
    Drain,
    /// Keep evaluating subgraphs that do not depend on the failure.
    Continue,
}

/// Behaviour when the caller cancels an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelMode {
    /// Abandon in-flight work and remove it from executors.
    Immediate,
    /// Stop dispatching and let in-flight work finish.
    Drain,
}

/// Order in which admitted-but-waiting nodes are offered to executors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    Fifo,
    LargestFirst,
}

/// Evaluation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub retry: RetryPolicy,
    pub on_error: ErrorHandling,
    pub cancel: CancelMode,
    pub scheduling: SchedulingPolicy,
    /// Upper bound on concurrently dispatched execs, across executors.
    /// `None` and `Some(0)` both mean unbounded.
    pub max_parallel: Option<usize>,
    /// Resubmit transient failures to a different executor when one fits.
    pub rotate_executors: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            on_error: ErrorHandling::Continue,
            cancel: CancelMode::Immediate,
            scheduling: SchedulingPolicy::Fifo,
            max_parallel: None,
            rotate_executors: false,
        }
    }
}
