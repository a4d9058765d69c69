//! spewguard — log ingestion and instance supervision that survives
//! extreme output volume.
//!
//! # Architecture
//!
//! ```text
//! Supervisor ──spawns──► instance ──stdout/stderr──► Pipeline
//!     ▲                                                 │
//!     └────────── LivenessSignal (never volume) ────────┘
//! ```
//!
//! The heavy lifting lives in `spewguard-core` (buffering, governance,
//! forwarding) and `spewguard-feeds` (process/stdin sources, HTTP and
//! JSON-lines sinks). This crate wires them into a supervised pipeline and
//! the `spewguard` binary.

pub mod pipeline;
pub mod spew;
pub mod supervisor;

pub use pipeline::Pipeline;
pub use supervisor::{decide, Decision, Supervisor, SupervisorError};
