//! Core types for spewguard-core.
//!
//! This module defines the data that moves through the pipeline: the
//! [`SourceId`] naming an instance, the [`StreamKind`] a chunk was read from,
//! and the [`LogFrame`] handed from the buffer to the forwarder.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Identifier of one running application instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which output pipe of an instance produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// A bounded slice of instance output with its per-source sequence number.
///
/// Frames are created by the [`ChunkBuffer`](crate::buffer::ChunkBuffer) and
/// moved to the forwarder when drained. They are deliberately not `Clone`:
/// exactly one pipeline stage owns a frame at a time.
#[derive(Debug, PartialEq)]
pub struct LogFrame {
    pub source_id: SourceId,
    /// Strictly increasing per `source_id`, starting at 0.
    pub sequence: u64,
    pub stream: StreamKind,
    /// Never longer than the configured `max_frame_bytes`.
    pub payload: Bytes,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl LogFrame {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Wire shape of a frame: payload bytes are rendered as lossy UTF-8.
#[derive(Serialize)]
struct WireFrame<'a> {
    source_id: &'a str,
    sequence: u64,
    stream: StreamKind,
    timestamp: &'a chrono::DateTime<chrono::Utc>,
    payload: Cow<'a, str>,
}

impl Serialize for LogFrame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireFrame {
            source_id: self.source_id.as_str(),
            sequence: self.sequence,
            stream: self.stream,
            timestamp: &self.timestamp,
            payload: String::from_utf8_lossy(&self.payload),
        }
        .serialize(serializer)
    }
}
