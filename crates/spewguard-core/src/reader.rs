//! Stream reader. Pulls raw output from an instance into its buffer.
//!
//! An [`Attach`] implementation hands over an instance's stdout/stderr pipes.
//! [`StreamHandle::read_chunk`] returns whatever one `read` yields on either
//! pipe, so the emitting process is never held up waiting for a frame to
//! fill. [`StreamReader::run`] is the per-source task: it keeps reading and
//! enqueueing until EOF, cancellation, or retry exhaustion.

use crate::backoff::Backoff;
use crate::buffer::{ChunkBuffer, EnqueueOutcome};
use crate::config::ReaderConfig;
use crate::error::IoFailure;
use crate::governor::VolumeGovernor;
use crate::liveness::LostReason;
use crate::types::{SourceId, StreamKind};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

pub type BoxedPipe = Box<dyn AsyncRead + Send + Unpin>;

/// The output pipes of one instance. Either may be absent.
pub struct InstanceOutput {
    pub stdout: Option<BoxedPipe>,
    pub stderr: Option<BoxedPipe>,
}

impl InstanceOutput {
    pub fn new(
        stdout: impl AsyncRead + Send + Unpin + 'static,
        stderr: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdout: Some(Box::new(stdout)),
            stderr: Some(Box::new(stderr)),
        }
    }

    pub fn stdout_only(stdout: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            stdout: Some(Box::new(stdout)),
            stderr: None,
        }
    }
}

/// Boundary to the container runtime: source id in, byte streams out.
pub trait Attach: Send + Sync {
    fn attach(&self, source_id: &SourceId) -> std::io::Result<InstanceOutput>;
}

#[derive(Debug, PartialEq)]
pub enum ReadChunk {
    Bytes(StreamKind, Bytes),
    /// Both pipes are closed.
    Eof,
}

/// How a reader task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    Eof,
    Lost,
    Cancelled,
}

/// An attached instance's pipes, multiplexed.
///
/// Each pipe reads into its own reusable scratch buffer and every chunk is
/// copied out at its exact length, so a frame never keeps a larger
/// allocation alive than the bytes it carries.
pub struct StreamHandle {
    source_id: SourceId,
    stdout: Option<BoxedPipe>,
    stderr: Option<BoxedPipe>,
    out_scratch: Box<[u8]>,
    err_scratch: Box<[u8]>,
}

impl StreamHandle {
    pub fn new(source_id: SourceId, output: InstanceOutput, chunk_bytes: usize) -> Self {
        let scratch = |pipe: &Option<BoxedPipe>| {
            let len = if pipe.is_some() { chunk_bytes.max(1) } else { 0 };
            vec![0u8; len].into_boxed_slice()
        };
        Self {
            source_id,
            out_scratch: scratch(&output.stdout),
            err_scratch: scratch(&output.stderr),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub async fn read_chunk(&mut self) -> Result<ReadChunk, IoFailure> {
        loop {
            if self.stdout.is_none() && self.stderr.is_none() {
                return Ok(ReadChunk::Eof);
            }

            let (kind, result) = tokio::select! {
                r = read_pipe(&mut self.stdout, &mut self.out_scratch), if self.stdout.is_some() => {
                    (StreamKind::Stdout, r)
                }
                r = read_pipe(&mut self.stderr, &mut self.err_scratch), if self.stderr.is_some() => {
                    (StreamKind::Stderr, r)
                }
            };

            match result {
                Ok(0) => {
                    tracing::debug!(source_id = %self.source_id, stream = %kind, "reader: pipe closed");
                    match kind {
                        StreamKind::Stdout => self.stdout = None,
                        StreamKind::Stderr => self.stderr = None,
                    }
                }
                Ok(n) => {
                    let scratch = match kind {
                        StreamKind::Stdout => &self.out_scratch,
                        StreamKind::Stderr => &self.err_scratch,
                    };
                    return Ok(ReadChunk::Bytes(kind, Bytes::copy_from_slice(&scratch[..n])));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(IoFailure::Read {
                        source_id: self.source_id.clone(),
                        stream: kind,
                        source,
                    })
                }
            }
        }
    }
}

async fn read_pipe(pipe: &mut Option<BoxedPipe>, buf: &mut [u8]) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => std::future::pending().await,
    }
}

pub struct StreamReader<A> {
    attacher: A,
    config: ReaderConfig,
    backoff: Backoff,
}

impl<A: Attach> StreamReader<A> {
    pub fn new(attacher: A, config: ReaderConfig) -> Self {
        let backoff = config.backoff();
        Self {
            attacher,
            config,
            backoff,
        }
    }

    /// Replace the retry schedule (tests use a deterministic one).
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn attach(&self, source_id: &SourceId) -> Result<StreamHandle, IoFailure> {
        self.attacher
            .attach(source_id)
            .map(|output| StreamHandle::new(source_id.clone(), output, self.config.read_chunk_bytes))
            .map_err(|source| IoFailure::Attach {
                source_id: source_id.clone(),
                source,
            })
    }

    /// Read `source_id` into `buffer` until EOF, cancellation, or the retry
    /// budget runs out. EOF and exhaustion mark the source Lost; cancellation
    /// leaves its state alone.
    pub async fn run(
        &self,
        source_id: SourceId,
        buffer: Arc<ChunkBuffer>,
        governor: Arc<VolumeGovernor>,
        cancel: CancellationToken,
    ) -> ReaderExit {
        let mut handle: Option<StreamHandle> = None;
        let mut failures = 0u32;

        loop {
            if handle.is_none() {
                match self.attach(&source_id) {
                    Ok(attached) => handle = Some(attached),
                    Err(failure) => {
                        failures += 1;
                        match self.back_off(&source_id, &governor, &cancel, failures, failure).await {
                            Some(exit) => return exit,
                            None => continue,
                        }
                    }
                }
            }
            let Some(current) = handle.as_mut() else {
                continue;
            };

            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ReaderExit::Cancelled,
                chunk = current.read_chunk() => chunk,
            };

            match chunk {
                Ok(ReadChunk::Bytes(stream, bytes)) => {
                    failures = 0;
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return ReaderExit::Cancelled,
                        outcome = buffer.enqueue(stream, bytes) => outcome,
                    };
                    if let EnqueueOutcome::Dropped { dropped_frames, dropped_bytes, .. } = outcome {
                        tracing::trace!(
                            source_id = %source_id,
                            dropped_frames,
                            dropped_bytes,
                            "reader: output dropped"
                        );
                    }
                }
                Ok(ReadChunk::Eof) => {
                    tracing::info!(source_id = %source_id, "reader: instance output closed");
                    governor.mark_lost(&source_id, LostReason::InstanceTerminated);
                    return ReaderExit::Eof;
                }
                Err(failure) => {
                    handle = None;
                    failures += 1;
                    if let Some(exit) = self.back_off(&source_id, &governor, &cancel, failures, failure).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// Sleep before the next attempt, or give up once the budget is spent.
    async fn back_off(
        &self,
        source_id: &SourceId,
        governor: &VolumeGovernor,
        cancel: &CancellationToken,
        failures: u32,
        failure: IoFailure,
    ) -> Option<ReaderExit> {
        if self.backoff.exhausted(failures) {
            tracing::error!(
                source_id = %source_id,
                attempts = failures,
                error = %failure,
                "reader: retries exhausted, source lost"
            );
            governor.mark_lost(source_id, LostReason::StreamLost);
            return Some(ReaderExit::Lost);
        }

        let delay = self.backoff.delay(failures);
        tracing::warn!(
            source_id = %source_id,
            attempt = failures,
            ?delay,
            error = %failure,
            "reader: io failure, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => Some(ReaderExit::Cancelled),
            _ = tokio::time::sleep(delay) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
