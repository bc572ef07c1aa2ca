//! Engine configuration.
//!
//! [`ReconciliationConfig`] replaces scattered runtime flag checks: it is
//! built once per invocation and handed to every component that branches on
//! instance or project settings. [`DispatcherConfig`] sizes the worker pool
//! and its retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Behavior switches for one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Evaluate child pipelines through their root ancestor and count
    /// descendant findings.
    pub aggregate_child_pipelines: bool,
    /// Treat `manual` pipelines as finished.
    pub manual_is_terminal: bool,
    /// Skip findings jobs whose pipeline is no longer the merge request head.
    pub skip_stale_pipelines: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            aggregate_child_pipelines: true,
            manual_is_terminal: false,
            skip_stale_pipelines: true,
        }
    }
}

impl ReconciliationConfig {
    pub fn with_child_pipeline_aggregation(mut self, enabled: bool) -> Self {
        self.aggregate_child_pipelines = enabled;
        self
    }

    pub fn with_manual_as_terminal(mut self, enabled: bool) -> Self {
        self.manual_is_terminal = enabled;
        self
    }

    pub fn with_stale_pipeline_skip(mut self, enabled: bool) -> Self {
        self.skip_stale_pipelines = enabled;
        self
    }
}

/// Retry policy for failed jobs: capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first run
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_backoff.saturating_mul(1u32 << exp);
        delay.min(self.max_backoff)
    }
}

/// Worker pool sizing for the queue dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
        }
    }
}
