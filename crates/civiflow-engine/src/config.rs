//! Engine configuration

use std::time::Duration;

use crate::reliability::RetryPolicy;

/// Tuning knobs for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum instances advanced concurrently
    pub max_concurrent_instances: usize,

    /// Soft cap on the ready queue; beyond it new instance creation is
    /// rejected with `EngineError::Busy`
    pub ready_queue_soft_cap: usize,

    /// Maximum hook-chain depth from a root instance; listener creation
    /// beyond it is skipped with a warning
    pub hook_depth_limit: u32,

    /// How often the sweeper scans the wait table for timed wakes and
    /// timeouts
    pub sweep_interval: Duration,

    /// Backoff applied to `Retry` results that carry no explicit delay
    pub retry_policy: RetryPolicy,

    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_instances: 10,
            ready_queue_soft_cap: 1024,
            hook_depth_limit: 8,
            sweep_interval: Duration::from_secs(1),
            retry_policy: RetryPolicy::exponential(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum concurrent instances
    pub fn with_max_concurrent_instances(mut self, max: usize) -> Self {
        self.max_concurrent_instances = max.max(1);
        self
    }

    /// Set the ready-queue soft cap
    pub fn with_ready_queue_soft_cap(mut self, cap: usize) -> Self {
        self.ready_queue_soft_cap = cap;
        self
    }

    /// Set the hook depth limit
    pub fn with_hook_depth_limit(mut self, limit: u32) -> Self {
        self.hook_depth_limit = limit;
        self
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the default retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
