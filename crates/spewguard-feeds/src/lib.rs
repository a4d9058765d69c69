//! spewguard-feeds — concrete sources and sinks for the spewguard pipeline.
//!
//! Sources implement [`spewguard_core::Attach`] and hand instance output to a
//! stream reader. Sinks implement [`spewguard_core::Aggregator`] and receive
//! batches from the forwarder.

pub mod http;
pub mod process;
pub mod stdin;
pub mod writer;

pub use http::HttpAggregator;
pub use process::ChildAttacher;
pub use stdin::StdinAttacher;
pub use writer::WriterAggregator;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid aggregator endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}
