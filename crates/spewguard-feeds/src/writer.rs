//! JSON-lines aggregator over any async writer (stdout by default).

use futures::future::BoxFuture;
use spewguard_core::error::TransportError;
use spewguard_core::{Aggregator, LogFrame};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Writes one JSON object per frame, newline-terminated. A batch is written
/// with a single `write_all` so batches from different sources never
/// interleave mid-line.
pub struct WriterAggregator<W> {
    writer: Mutex<W>,
}

impl<W> WriterAggregator<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl WriterAggregator<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Send + Unpin> Aggregator for WriterAggregator<W> {
    fn send<'a>(&'a self, frames: &'a [LogFrame]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut lines = Vec::with_capacity(frames.iter().map(|f| f.len() + 128).sum());
            for frame in frames {
                serde_json::to_writer(&mut lines, frame)?;
                lines.push(b'\n');
            }
            let mut writer = self.writer.lock().await;
            writer.write_all(&lines).await?;
            writer.flush().await?;
            Ok::<_, TransportError>(())
        })
    }
}
