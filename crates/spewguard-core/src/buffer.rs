//! Bounded per-source queue of [`LogFrame`]s.
//!
//! The stream reader is the only appender and the forwarder the only drainer.
//! The inner lock is a plain `std::sync::Mutex` that is only held for
//! in-memory bookkeeping; every wait (stall policy, detach grace) happens on a
//! [`Notify`] with the lock released.
//!
//! `pending_bytes` never exceeds `capacity_bytes`. Backpressure follows a
//! hysteresis band: it engages when `pending_bytes ≥ high_watermark` and
//! releases only once `pending_bytes ≤ low_watermark`. Each flip is reported
//! to the [`FillObserver`] (the governor in production).

use crate::config::{DropPolicy, OversizePolicy, PipelineConfig};
use crate::types::{LogFrame, SourceId, StreamKind};
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Observer seam
// ---------------------------------------------------------------------------

/// Receives fill-level events from a [`ChunkBuffer`].
///
/// Called with the buffer lock held, so implementations must not call back
/// into the buffer.
pub trait FillObserver: Send + Sync {
    fn on_backpressure(&self, engaged: bool, state: &BufferState);

    /// New frames became available to drain.
    fn on_data(&self) {}
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl FillObserver for NoopObserver {
    fn on_backpressure(&self, _engaged: bool, _state: &BufferState) {}
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Point-in-time view of one source's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferState {
    pub pending_bytes: usize,
    pub pending_frames: usize,
    pub capacity: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub dropped_count: u64,
    pub dropped_bytes: u64,
    pub backpressured: bool,
}

/// Result of [`ChunkBuffer::enqueue`]. There is no error case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// All bytes were appended as `frames` new frames.
    Accepted { frames: usize },
    /// Some bytes (new or previously pending) were discarded to honour the
    /// capacity. `accepted` frames from this call were still appended.
    Dropped {
        accepted: usize,
        dropped_frames: u64,
        dropped_bytes: u64,
    },
    /// The caller was suspended for `waited` before everything fit.
    Stalled { frames: usize, waited: Duration },
}

impl EnqueueOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, EnqueueOutcome::Dropped { .. })
    }
}

#[derive(Default)]
struct Tally {
    accepted: usize,
    dropped_frames: u64,
    dropped_bytes: u64,
    stalled: bool,
}

impl Tally {
    fn record_drop(&mut self, frames: u64, bytes: usize) {
        self.dropped_frames += frames;
        self.dropped_bytes += bytes as u64;
    }

    fn outcome(self, started: Instant) -> EnqueueOutcome {
        if self.dropped_frames > 0 {
            EnqueueOutcome::Dropped {
                accepted: self.accepted,
                dropped_frames: self.dropped_frames,
                dropped_bytes: self.dropped_bytes,
            }
        } else if self.stalled {
            EnqueueOutcome::Stalled {
                frames: self.accepted,
                waited: started.elapsed(),
            }
        } else {
            EnqueueOutcome::Accepted {
                frames: self.accepted,
            }
        }
    }
}

struct Inner {
    frames: VecDeque<LogFrame>,
    pending_bytes: usize,
    next_sequence: u64,
    dropped_count: u64,
    dropped_bytes: u64,
    backpressured: bool,
}

impl Inner {
    fn record_drop(&mut self, frames: u64, bytes: usize) {
        self.dropped_count += frames;
        self.dropped_bytes += bytes as u64;
    }
}

// ---------------------------------------------------------------------------
// ChunkBuffer
// ---------------------------------------------------------------------------

pub struct ChunkBuffer {
    source_id: SourceId,
    config: PipelineConfig,
    inner: Mutex<Inner>,
    drained: Notify,
    observer: Arc<dyn FillObserver>,
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("source_id", &self.source_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ChunkBuffer {
    pub fn new(source_id: SourceId, config: PipelineConfig, observer: Arc<dyn FillObserver>) -> Self {
        Self {
            source_id,
            config,
            inner: Mutex::new(Inner {
                frames: VecDeque::new(),
                pending_bytes: 0,
                next_sequence: 0,
                dropped_count: 0,
                dropped_bytes: 0,
                backpressured: false,
            }),
            drained: Notify::new(),
            observer,
        }
    }

    /// A buffer nobody observes. Handy for tests and benches.
    pub fn unobserved(source_id: SourceId, config: PipelineConfig) -> Self {
        Self::new(source_id, config, Arc::new(NoopObserver))
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Append `bytes` as one or more frames, applying the configured
    /// oversize and drop policies.
    pub async fn enqueue(&self, stream: StreamKind, bytes: Bytes) -> EnqueueOutcome {
        let started = Instant::now();
        let mut tally = Tally::default();

        if bytes.is_empty() {
            return tally.outcome(started);
        }

        let max_frame = self.config.max_frame_bytes;
        if bytes.len() > max_frame && self.config.oversize_policy == OversizePolicy::Reject {
            self.lock().record_drop(1, bytes.len());
            tally.record_drop(1, bytes.len());
            tracing::debug!(
                source_id = %self.source_id,
                len = bytes.len(),
                max_frame,
                "buffer: oversize chunk rejected"
            );
            return tally.outcome(started);
        }

        let deadline = started + self.config.max_stall();
        let mut rest = bytes;
        while !rest.is_empty() {
            let piece = rest.split_to(rest.len().min(max_frame));
            match self.config.drop_policy {
                DropPolicy::DropNewest => self.push_or_drop(stream, piece, &mut tally),
                DropPolicy::DropOldest => self.push_evicting(stream, piece, &mut tally),
                DropPolicy::Block => self.push_blocking(stream, piece, deadline, &mut tally).await,
            }
        }

        if tally.accepted > 0 {
            self.observer.on_data();
        }
        tally.outcome(started)
    }

    fn push_or_drop(&self, stream: StreamKind, piece: Bytes, tally: &mut Tally) {
        let mut inner = self.lock();
        if inner.pending_bytes + piece.len() <= self.config.capacity_bytes {
            self.push_locked(&mut inner, stream, piece);
            tally.accepted += 1;
        } else {
            inner.record_drop(1, piece.len());
            tally.record_drop(1, piece.len());
        }
    }

    fn push_evicting(&self, stream: StreamKind, piece: Bytes, tally: &mut Tally) {
        let mut inner = self.lock();
        // A piece larger than the whole buffer can never fit; evicting for it
        // would only empty the queue.
        if piece.len() > self.config.capacity_bytes {
            inner.record_drop(1, piece.len());
            tally.record_drop(1, piece.len());
            return;
        }
        while inner.pending_bytes + piece.len() > self.config.capacity_bytes {
            let Some(evicted) = inner.frames.pop_front() else {
                break;
            };
            inner.pending_bytes -= evicted.len();
            inner.record_drop(1, evicted.len());
            tally.record_drop(1, evicted.len());
        }
        self.push_locked(&mut inner, stream, piece);
        tally.accepted += 1;
    }

    async fn push_blocking(
        &self,
        stream: StreamKind,
        piece: Bytes,
        deadline: Instant,
        tally: &mut Tally,
    ) {
        let mut stalled = false;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                let fits = inner.pending_bytes + piece.len() <= self.config.capacity_bytes;
                let released = !stalled || inner.pending_bytes <= self.config.low_watermark;
                if fits && released {
                    self.push_locked(&mut inner, stream, piece);
                    tally.accepted += 1;
                    return;
                }
                if piece.len() > self.config.capacity_bytes || Instant::now() >= deadline {
                    inner.record_drop(1, piece.len());
                    tally.record_drop(1, piece.len());
                    tracing::debug!(
                        source_id = %self.source_id,
                        len = piece.len(),
                        "buffer: stall timed out, dropping"
                    );
                    return;
                }
            }

            if !stalled {
                tracing::trace!(source_id = %self.source_id, "buffer: reader stalled");
            }
            stalled = true;
            tally.stalled = true;
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    fn push_locked(&self, inner: &mut Inner, stream: StreamKind, payload: Bytes) {
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.pending_bytes += payload.len();
        inner.frames.push_back(LogFrame {
            source_id: self.source_id.clone(),
            sequence,
            stream,
            payload,
            timestamp: chrono::Utc::now(),
        });
        self.settle(inner);
    }

    /// Remove up to `max_frames` frames from the front, oldest first.
    pub fn take_batch(&self, max_frames: usize) -> Vec<LogFrame> {
        let batch: Vec<LogFrame> = {
            let mut inner = self.lock();
            let n = max_frames.min(inner.frames.len());
            let batch: Vec<LogFrame> = inner.frames.drain(..n).collect();
            inner.pending_bytes -= batch.iter().map(LogFrame::len).sum::<usize>();
            self.settle(&mut inner);
            batch
        };
        if !batch.is_empty() {
            self.drained.notify_waiters();
        }
        batch
    }

    /// Put an unsent batch back at the front, preserving sequence order.
    ///
    /// Frames already pending are never evicted for a requeue; if the batch
    /// no longer fits, its oldest frames are dropped.
    pub fn requeue_front(&self, frames: Vec<LogFrame>) {
        let mut inner = self.lock();
        for frame in frames.into_iter().rev() {
            if inner.pending_bytes + frame.len() <= self.config.capacity_bytes {
                inner.pending_bytes += frame.len();
                inner.frames.push_front(frame);
            } else {
                inner.record_drop(1, frame.len());
            }
        }
        self.settle(&mut inner);
    }

    /// Wait until the forwarder has drained every pending frame, or `grace`
    /// elapses. Returns whether the buffer ended up empty.
    pub async fn wait_until_empty(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_empty();
            }
        }
    }

    pub fn state(&self) -> BufferState {
        let inner = self.lock();
        self.snapshot(&inner)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.lock().pending_bytes
    }

    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped_count
    }

    fn settle(&self, inner: &mut Inner) {
        let engaged = if inner.backpressured {
            inner.pending_bytes > self.config.low_watermark
        } else {
            inner.pending_bytes >= self.config.high_watermark
        };
        if engaged != inner.backpressured {
            inner.backpressured = engaged;
            let state = self.snapshot(inner);
            tracing::debug!(
                source_id = %self.source_id,
                engaged,
                pending_bytes = state.pending_bytes,
                "buffer: backpressure changed"
            );
            self.observer.on_backpressure(engaged, &state);
        }
    }

    fn snapshot(&self, inner: &Inner) -> BufferState {
        BufferState {
            pending_bytes: inner.pending_bytes,
            pending_frames: inner.frames.len(),
            capacity: self.config.capacity_bytes,
            high_watermark: self.config.high_watermark,
            low_watermark: self.config.low_watermark,
            dropped_count: inner.dropped_count,
            dropped_bytes: inner.dropped_bytes,
            backpressured: inner.backpressured,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
