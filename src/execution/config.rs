//! Runner configuration
//!
//! Configuration for the superstep engine including parallelism, timeouts,
//! checkpointing, retry and failure policies.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::WorkflowError;

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum supersteps per run before it is faulted
    pub max_supersteps: usize,

    /// Maximum concurrent executor dispatches within a superstep
    pub parallelism: usize,

    /// Checkpoint frequency (every N supersteps, 0 = only when halting)
    pub checkpoint_interval: usize,

    /// Timeout for a single handler invocation
    #[serde(with = "humantime_serde")]
    pub executor_timeout: Duration,

    /// Timeout for one drive of the run (start or resume until halt)
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,

    /// Retry policy for failed handlers
    pub retry_policy: RetryPolicy,

    /// Fault the run after a superstep with executor failures
    pub halt_on_executor_failure: bool,

    /// Buffer size of the live event broadcast
    pub event_channel_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_supersteps: 100,
            parallelism: num_cpus::get(),
            checkpoint_interval: 1,
            executor_timeout: Duration::from_secs(300), // 5 min per handler
            run_timeout: Duration::from_secs(3600),     // 1 hour per drive
            retry_policy: RetryPolicy::no_retry(),
            halt_on_executor_failure: true,
            event_channel_capacity: 256,
        }
    }
}

impl RunnerConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `WORKFLOW_*` environment variables
    ///
    /// Unset variables keep their defaults; unparsable ones are an error.
    pub fn from_env() -> Result<Self, WorkflowError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkflowError> {
        let mut config = Self::default();

        if let Some(max) = parse_var(&lookup, "WORKFLOW_MAX_SUPERSTEPS")? {
            config = config.with_max_supersteps(max);
        }
        if let Some(parallelism) = parse_var(&lookup, "WORKFLOW_PARALLELISM")? {
            config = config.with_parallelism(parallelism);
        }
        if let Some(interval) = parse_var(&lookup, "WORKFLOW_CHECKPOINT_INTERVAL")? {
            config = config.with_checkpoint_interval(interval);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WORKFLOW_EXECUTOR_TIMEOUT_SECS")? {
            config = config.with_executor_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WORKFLOW_RUN_TIMEOUT_SECS")? {
            config = config.with_run_timeout(Duration::from_secs(secs));
        }
        if let Some(halt) = parse_var(&lookup, "WORKFLOW_HALT_ON_FAILURE")? {
            config = config.with_halt_on_executor_failure(halt);
        }

        Ok(config)
    }

    /// Set maximum supersteps
    pub fn with_max_supersteps(mut self, max: usize) -> Self {
        self.max_supersteps = max;
        self
    }

    /// Set parallelism level
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set checkpoint interval (0 to checkpoint only when the run halts)
    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set executor timeout
    pub fn with_executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout = timeout;
        self
    }

    /// Set run timeout
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Set retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the failure policy
    pub fn with_halt_on_executor_failure(mut self, halt: bool) -> Self {
        self.halt_on_executor_failure = halt;
        self
    }

    /// Set the event broadcast buffer size
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Check if a checkpoint should be taken after this superstep
    #[allow(clippy::manual_is_multiple_of)]
    pub fn should_checkpoint(&self, superstep: usize) -> bool {
        self.checkpoint_interval > 0 && superstep > 0 && superstep % self.checkpoint_interval == 0
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, WorkflowError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| WorkflowError::config(format!("invalid value for {}: {:?}", key, raw))),
    }
}

/// Retry policy for failed handler invocations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts
    pub max_retries: usize,

    /// Base delay for exponential backoff
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set backoff base duration
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set maximum backoff duration
    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    /// Calculate delay for a given retry attempt (exponential backoff)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt as u32);
        let delay = self.backoff_base.saturating_mul(multiplier);
        delay.min(self.backoff_max)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_retries
    }

    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}
