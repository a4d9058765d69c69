//! Test builders — ergonomic constructors for configs and pipeline parts.
//!
//! These are for readability in tests. They panic on invalid input rather
//! than returning `Result`.

use spewguard::Pipeline;
use spewguard_core::backoff::Backoff;
use spewguard_core::config::DropPolicy;
use spewguard_core::{Config, MemoryAggregator, VolumeGovernor};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Fluent builder over [`Config::defaults`].
///
/// ```rust
/// let config = ConfigBuilder::new()
///     .capacity(1024)
///     .watermarks(768, 256)
///     .drop_policy(DropPolicy::DropOldest)
///     .build();
/// ```
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::defaults(),
        }
    }

    pub fn max_frame(mut self, bytes: usize) -> Self {
        self.config.pipeline.max_frame_bytes = bytes;
        self
    }

    pub fn capacity(mut self, bytes: usize) -> Self {
        self.config.pipeline.capacity_bytes = bytes;
        self
    }

    pub fn watermarks(mut self, high: usize, low: usize) -> Self {
        self.config.pipeline.high_watermark = high;
        self.config.pipeline.low_watermark = low;
        self
    }

    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.config.pipeline.drop_policy = policy;
        self
    }

    pub fn max_stall_ms(mut self, ms: u64) -> Self {
        self.config.pipeline.max_stall_ms = ms;
        self
    }

    pub fn batch(mut self, frames: usize) -> Self {
        self.config.forwarder.batch_max_frames = frames;
        self
    }

    pub fn forwarder_retries(mut self, attempts: u32) -> Self {
        self.config.forwarder.retry_attempts = attempts;
        self.config.forwarder.backoff_initial_ms = 1;
        self.config.forwarder.backoff_max_ms = 1;
        self
    }

    pub fn degraded_threshold(mut self, failures: u32) -> Self {
        self.config.forwarder.degraded_threshold = failures;
        self
    }

    pub fn flush_interval_ms(mut self, ms: u64) -> Self {
        self.config.forwarder.flush_interval_ms = ms;
        self
    }

    pub fn detach_grace_ms(mut self, ms: u64) -> Self {
        self.config.forwarder.detach_grace_ms = ms;
        self
    }

    pub fn probe_interval_ms(mut self, ms: u64) -> Self {
        self.config.supervisor.probe_interval_ms = ms;
        self
    }

    pub fn max_restarts(mut self, restarts: u32) -> Self {
        self.config.supervisor.max_restarts = restarts;
        self
    }

    pub fn build(self) -> Config {
        self.config.validate().expect("test config must validate");
        self.config
    }
}

// ---------------------------------------------------------------------------
// Assembled parts
// ---------------------------------------------------------------------------

pub fn governor(config: &Config) -> Arc<VolumeGovernor> {
    Arc::new(VolumeGovernor::new(
        config.pipeline.clone(),
        &config.forwarder,
    ))
}

/// Constant 1ms retry schedule with `attempts` tries.
pub fn fast_backoff(attempts: u32) -> Backoff {
    Backoff::new(Duration::from_millis(1), Duration::from_millis(1), attempts)
}

/// A running pipeline that delivers into memory.
pub fn memory_pipeline(config: Config) -> (Pipeline, Arc<MemoryAggregator>) {
    let memory = Arc::new(MemoryAggregator::new());
    (Pipeline::start(config, memory.clone()), memory)
}
