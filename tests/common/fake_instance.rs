//! Fake instance output for reader and pipeline tests.
//!
//! [`fake_instance`] returns a writer the test drives and an [`Attach`]
//! implementation the pipeline consumes, linked by in-memory duplex pipes.
//! Works with `tokio::time::pause()`.

use spewguard_core::{Attach, InstanceOutput, SourceId};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};

/// The instance side: what the app writes to stdout/stderr.
pub struct FakeInstanceWriter {
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
}

impl FakeInstanceWriter {
    pub async fn out(&mut self, bytes: &[u8]) {
        self.stdout.write_all(bytes).await.unwrap();
    }

    pub async fn err(&mut self, bytes: &[u8]) {
        self.stderr.write_all(bytes).await.unwrap();
    }

    /// Close both pipes; the reader sees EOF.
    pub fn exit(self) {}
}

/// Hands out its pipes on the first attach only.
pub struct OnceAttacher {
    output: Mutex<Option<InstanceOutput>>,
}

impl OnceAttacher {
    pub fn new(output: InstanceOutput) -> Self {
        Self {
            output: Mutex::new(Some(output)),
        }
    }
}

impl Attach for OnceAttacher {
    fn attach(&self, _: &SourceId) -> io::Result<InstanceOutput> {
        self.output
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

/// Create a linked writer/attacher pair with `pipe_bytes` of pipe buffer.
pub fn fake_instance(pipe_bytes: usize) -> (FakeInstanceWriter, OnceAttacher) {
    let (stdout, stdout_r) = tokio::io::duplex(pipe_bytes);
    let (stderr, stderr_r) = tokio::io::duplex(pipe_bytes);
    (
        FakeInstanceWriter { stdout, stderr },
        OnceAttacher::new(InstanceOutput::new(stdout_r, stderr_r)),
    )
}

/// An attacher whose runtime is gone: every attach fails.
#[derive(Default)]
pub struct DeadAttacher {
    pub calls: AtomicU32,
}

impl Attach for DeadAttacher {
    fn attach(&self, _: &SourceId) -> io::Result<InstanceOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(io::ErrorKind::ConnectionRefused.into())
    }
}
