//! Configuration types for spewguard.
//!
//! [`Config::load`] layers, in order: the embedded defaults, an optional TOML
//! file (an explicit path, else `~/.config/spewguard/config.toml` if present),
//! and `SPEWGUARD__SECTION__KEY` environment variables. [`Config::defaults`]
//! returns the embedded defaults without touching the filesystem (useful in
//! tests).

use crate::backoff::Backoff;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Embedded defaults
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"
[pipeline]
max_frame_bytes  = 16384
capacity_bytes   = 1048576
high_watermark   = 786432
low_watermark    = 262144
drop_policy      = "drop_oldest"
oversize_policy  = "split"
max_stall_ms     = 250

[reader]
read_chunk_bytes   = 65536
retry_attempts     = 5
backoff_initial_ms = 50
backoff_max_ms     = 2000

[forwarder]
batch_max_frames   = 256
retry_attempts     = 3
backoff_initial_ms = 100
backoff_max_ms     = 5000
degraded_threshold = 5
flush_interval_ms  = 200
detach_grace_ms    = 2000

[supervisor]
probe_interval_ms = 1000
max_restarts      = 3

[aggregator]
timeout_ms = 5000
"#;

const ENV_PREFIX: &str = "SPEWGUARD";

// ---------------------------------------------------------------------------
// Public config types
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

/// What the chunk buffer does with bytes that do not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Discard the incoming bytes.
    DropNewest,
    /// Evict the oldest pending frames to make room.
    DropOldest,
    /// Suspend the reader until the buffer drains, up to `max_stall_ms`.
    Block,
}

/// What the chunk buffer does with a chunk longer than `max_frame_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OversizePolicy {
    Split,
    Reject,
}

/// `[pipeline]` section: chunk buffer sizing and overflow policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicy,
    #[serde(default = "default_oversize_policy")]
    pub oversize_policy: OversizePolicy,
    #[serde(default = "default_max_stall_ms")]
    pub max_stall_ms: u64,
}

fn default_max_frame_bytes() -> usize { 16 * 1024 }
fn default_capacity_bytes() -> usize { 1024 * 1024 }
fn default_high_watermark() -> usize { 768 * 1024 }
fn default_low_watermark() -> usize { 256 * 1024 }
fn default_drop_policy() -> DropPolicy { DropPolicy::DropOldest }
fn default_oversize_policy() -> OversizePolicy { OversizePolicy::Split }
fn default_max_stall_ms() -> u64 { 250 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            capacity_bytes: default_capacity_bytes(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            drop_policy: default_drop_policy(),
            oversize_policy: default_oversize_policy(),
            max_stall_ms: default_max_stall_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn max_stall(&self) -> Duration {
        Duration::from_millis(self.max_stall_ms)
    }
}

/// `[reader]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub read_chunk_bytes: usize,
    pub retry_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_chunk_bytes: 64 * 1024,
            retry_attempts: 5,
            backoff_initial_ms: 50,
            backoff_max_ms: 2000,
        }
    }
}

impl ReaderConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.retry_attempts,
        )
        .with_jitter(true)
    }
}

/// `[forwarder]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwarderConfig {
    pub batch_max_frames: usize,
    pub retry_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failed drains of one source before it is Degraded.
    pub degraded_threshold: u32,
    pub flush_interval_ms: u64,
    pub detach_grace_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            batch_max_frames: 256,
            retry_attempts: 3,
            backoff_initial_ms: 100,
            backoff_max_ms: 5000,
            degraded_threshold: 5,
            flush_interval_ms: 200,
            detach_grace_ms: 2000,
        }
    }
}

impl ForwarderConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.retry_attempts,
        )
        .with_jitter(true)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn detach_grace(&self) -> Duration {
        Duration::from_millis(self.detach_grace_ms)
    }
}

/// `[supervisor]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub probe_interval_ms: u64,
    pub max_restarts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1000,
            max_restarts: 3,
        }
    }
}

impl SupervisorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// `[aggregator]` section. Without an `endpoint`, frames are written to
/// stdout as JSON lines.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 5000,
        }
    }
}

impl AggregatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Config {
    /// Load the layered configuration. An explicit `path` must exist; the
    /// default path is optional and never created.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::from(config_path().as_path()).required(false),
        };

        let cfg: Config = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Return the built-in defaults without touching the filesystem.
    pub fn defaults() -> Self {
        config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .build()
            .expect("built-in default config must be valid TOML")
            .try_deserialize()
            .expect("built-in default config must deserialize correctly")
    }

    /// Reject combinations the buffer and governor cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.max_frame_bytes == 0 {
            return Err(invalid("pipeline.max_frame_bytes must be positive"));
        }
        if p.capacity_bytes < p.max_frame_bytes {
            return Err(invalid(format!(
                "pipeline.capacity_bytes ({}) must hold at least one frame ({})",
                p.capacity_bytes, p.max_frame_bytes
            )));
        }
        if p.low_watermark >= p.high_watermark {
            return Err(invalid(format!(
                "pipeline.low_watermark ({}) must be below high_watermark ({})",
                p.low_watermark, p.high_watermark
            )));
        }
        if p.high_watermark > p.capacity_bytes {
            return Err(invalid(format!(
                "pipeline.high_watermark ({}) exceeds capacity_bytes ({})",
                p.high_watermark, p.capacity_bytes
            )));
        }
        if self.reader.read_chunk_bytes == 0 {
            return Err(invalid("reader.read_chunk_bytes must be positive"));
        }
        if self.reader.retry_attempts == 0 || self.forwarder.retry_attempts == 0 {
            return Err(invalid("retry_attempts must be at least 1"));
        }
        if self.forwarder.batch_max_frames == 0 {
            return Err(invalid("forwarder.batch_max_frames must be positive"));
        }
        if self.forwarder.degraded_threshold == 0 {
            return Err(invalid("forwarder.degraded_threshold must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

fn config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
                .join(".config")
        })
        .join("spewguard")
        .join("config.toml")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
