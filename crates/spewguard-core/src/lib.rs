//! spewguard-core — log ingestion core for supervised application instances.
//!
//! This crate exposes the pipeline stages as public modules, plus the shared
//! types used across all of them.
//!
//! # Architecture
//!
//! ```text
//! StreamReader ──► ChunkBuffer ──► Forwarder ──► Aggregator
//!                      │               │
//!                      └──► VolumeGovernor ◄┘
//!                               │
//!                               └──► LivenessSignal ──► Supervisor
//! ```
//!
//! Readers and the forwarder never call each other. They coordinate only
//! through the per-source [`ChunkBuffer`](buffer::ChunkBuffer) and the
//! [`VolumeGovernor`](governor::VolumeGovernor) registry that owns it.

pub mod backoff;
pub mod buffer;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod governor;
pub mod liveness;
pub mod reader;
pub mod types;

pub use buffer::{BufferState, ChunkBuffer, EnqueueOutcome};
pub use config::Config;
pub use forwarder::{Aggregator, DrainOutcome, Forwarder, MemoryAggregator};
pub use governor::{GovernorState, StateTransition, VolumeGovernor};
pub use liveness::{LivenessReason, LivenessSignal, LostReason};
pub use reader::{Attach, InstanceOutput, ReadChunk, StreamReader};
pub use types::{LogFrame, SourceId, StreamKind};
