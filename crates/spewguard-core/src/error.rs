//! Error taxonomy for the pipeline.
//!
//! Reader failures ([`IoFailure`]) and aggregator failures
//! ([`TransportError`]) are recovered locally with bounded retry. Running out
//! of retries changes governor state; it never unwinds out of a pipeline task.
//! Capacity overflow is not an error at all: it surfaces as
//! [`EnqueueOutcome::Dropped`](crate::buffer::EnqueueOutcome::Dropped).

use crate::types::{SourceId, StreamKind};
use thiserror::Error;

/// A source's output streams could not be attached or read.
#[derive(Debug, Error)]
pub enum IoFailure {
    #[error("failed to attach output of {source_id}: {source}")]
    Attach {
        source_id: SourceId,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {stream} of {source_id}: {source}")]
    Read {
        source_id: SourceId,
        stream: StreamKind,
        #[source]
        source: std::io::Error,
    },
}

impl IoFailure {
    pub fn source_id(&self) -> &SourceId {
        match self {
            IoFailure::Attach { source_id, .. } | IoFailure::Read { source_id, .. } => source_id,
        }
    }
}

/// A single attempt to hand a batch to the aggregator failed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("aggregator unreachable: {0}")]
    Unreachable(String),
    #[error("aggregator rejected batch with status {status}")]
    Rejected { status: u16 },
    #[error("aggregator did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Every source with pending frames exhausted its send retries in one drain.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("transport failure for {} source(s)", sources.len())]
    TransportFailure { sources: Vec<SourceId> },
}

/// The layered configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
