//! Shared test utilities for spewguard integration harnesses.
//!
//! Import everything you need via `mod common; use common::*;` at the top of
//! each harness file. Everything here is deterministic under
//! `tokio::time::pause()` except the HTTP fake, which binds a real socket.

pub mod assertions;
pub mod builders;
pub mod fake_aggregator;
pub mod fake_instance;

pub use assertions::*;
pub use builders::*;
pub use fake_aggregator::*;
pub use fake_instance::*;
