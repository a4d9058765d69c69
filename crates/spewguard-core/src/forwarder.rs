//! The forwarder: single drainer of every source buffer.
//!
//! Each [`Forwarder::drain_once`] takes at most one batch per source, releases
//! the buffer lock, and hands the batch to the [`Aggregator`] with capped
//! exponential retry. A batch that still fails is put back at the front of
//! its buffer and the governor is told; after enough consecutive failures the
//! source is Degraded, which is never fatal. Frames of one source therefore
//! reach the aggregator in sequence order; different sources interleave.

use crate::backoff::Backoff;
use crate::config::ForwarderConfig;
use crate::error::{ForwardError, TransportError};
use crate::governor::VolumeGovernor;
use crate::types::{LogFrame, SourceId, StreamKind};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Aggregator boundary
// ---------------------------------------------------------------------------

/// Downstream log storage. One call delivers one batch, all from one source,
/// in sequence order.
pub trait Aggregator: Send + Sync {
    fn send<'a>(&'a self, frames: &'a [LogFrame]) -> BoxFuture<'a, Result<(), TransportError>>;
}

impl<A: Aggregator + ?Sized> Aggregator for Arc<A> {
    fn send<'a>(&'a self, frames: &'a [LogFrame]) -> BoxFuture<'a, Result<(), TransportError>> {
        (**self).send(frames)
    }
}

/// A frame as recorded by [`MemoryAggregator`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub source_id: SourceId,
    pub sequence: u64,
    pub stream: StreamKind,
    pub payload: Bytes,
}

/// Aggregator that keeps every delivered frame in memory.
#[derive(Debug, Default)]
pub struct MemoryAggregator {
    delivered: Mutex<Vec<Delivered>>,
}

impl MemoryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.lock().clone()
    }

    pub fn delivered_for(&self, source_id: &SourceId) -> Vec<Delivered> {
        self.lock()
            .iter()
            .filter(|d| &d.source_id == source_id)
            .cloned()
            .collect()
    }

    pub fn total_bytes(&self) -> usize {
        self.lock().iter().map(|d| d.payload.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Delivered>> {
        self.delivered.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Aggregator for MemoryAggregator {
    fn send<'a>(&'a self, frames: &'a [LogFrame]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.lock().extend(frames.iter().map(|f| Delivered {
                source_id: f.source_id.clone(),
                sequence: f.sequence,
                stream: f.stream,
                payload: f.payload.clone(),
            }));
            Ok::<_, TransportError>(())
        })
    }
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

/// Result of one pass over every buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every batch was delivered; `n` frames in total (0 when idle).
    Sent(usize),
    /// Some sources delivered, the listed ones did not.
    PartialSend { sent: usize, failed: Vec<SourceId> },
}

pub struct Forwarder {
    governor: Arc<VolumeGovernor>,
    aggregator: Arc<dyn Aggregator>,
    config: ForwarderConfig,
    backoff: Backoff,
}

impl Forwarder {
    pub fn new(
        governor: Arc<VolumeGovernor>,
        aggregator: Arc<dyn Aggregator>,
        config: ForwarderConfig,
    ) -> Self {
        let backoff = config.backoff();
        Self {
            governor,
            aggregator,
            config,
            backoff,
        }
    }

    /// Replace the retry schedule (tests use a deterministic one).
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn governor(&self) -> &Arc<VolumeGovernor> {
        &self.governor
    }

    /// Drain one batch from every source that has pending frames.
    pub async fn drain_once(&self) -> Result<DrainOutcome, ForwardError> {
        let mut sent = 0usize;
        let mut delivered_sources = 0usize;
        let mut failed = Vec::new();

        for source_id in self.governor.sources() {
            let Some(buffer) = self.governor.buffer(&source_id) else {
                continue;
            };
            let batch = buffer.take_batch(self.config.batch_max_frames);
            if batch.is_empty() {
                continue;
            }

            match self.send_with_retry(&source_id, &batch).await {
                Ok(()) => {
                    sent += batch.len();
                    delivered_sources += 1;
                    self.governor.report_drain_success(&source_id);
                }
                Err(e) => {
                    tracing::warn!(
                        source_id = %source_id,
                        frames = batch.len(),
                        error = %e,
                        "forwarder: batch undeliverable, requeued"
                    );
                    buffer.requeue_front(batch);
                    self.governor.report_transport_failure(&source_id);
                    failed.push(source_id);
                }
            }
        }

        if failed.is_empty() {
            Ok(DrainOutcome::Sent(sent))
        } else if delivered_sources > 0 {
            Ok(DrainOutcome::PartialSend { sent, failed })
        } else {
            Err(ForwardError::TransportFailure { sources: failed })
        }
    }

    async fn send_with_retry(
        &self,
        source_id: &SourceId,
        batch: &[LogFrame],
    ) -> Result<(), TransportError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.aggregator.send(batch).await {
                Ok(()) => return Ok(()),
                Err(e) if self.backoff.exhausted(attempt) => return Err(e),
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::debug!(
                        source_id = %source_id,
                        attempt,
                        ?delay,
                        error = %e,
                        "forwarder: send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Background loop: drain while there is work, otherwise wait for new
    /// data or the flush interval.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::debug!("forwarder: started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let busy = match self.drain_once().await {
                Ok(DrainOutcome::Sent(0)) => false,
                Ok(DrainOutcome::Sent(n)) => {
                    tracing::trace!(frames = n, "forwarder: drained");
                    true
                }
                Ok(DrainOutcome::PartialSend { sent, failed }) => {
                    tracing::warn!(sent, failed = failed.len(), "forwarder: partial send");
                    false
                }
                Err(e) => {
                    tracing::warn!(error = %e, "forwarder: drain failed");
                    false
                }
            };

            if busy {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.governor.data_ready().notified() => {}
                _ = tokio::time::sleep(self.config.flush_interval()) => {}
            }
        }
        tracing::debug!("forwarder: stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
