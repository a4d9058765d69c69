//! Child-process source: the stdout/stderr pipes of a spawned instance.

use spewguard_core::reader::BoxedPipe;
use spewguard_core::{Attach, InstanceOutput, SourceId};
use std::io;
use std::sync::{Mutex, PoisonError};
use tokio::process::Child;

/// Holds a child's pipes until the reader attaches. Pipes can be taken once;
/// a later attach (e.g. a reader retry) fails with `NotConnected`.
pub struct ChildAttacher {
    output: Mutex<Option<InstanceOutput>>,
}

impl ChildAttacher {
    /// Take the piped stdout/stderr out of `child`. Streams that were not
    /// configured as `Stdio::piped()` are simply absent.
    pub fn take_from(child: &mut Child) -> Self {
        let stdout = child.stdout.take().map(|p| Box::new(p) as BoxedPipe);
        let stderr = child.stderr.take().map(|p| Box::new(p) as BoxedPipe);
        let output = (stdout.is_some() || stderr.is_some())
            .then_some(InstanceOutput { stdout, stderr });
        Self {
            output: Mutex::new(output),
        }
    }
}

impl Attach for ChildAttacher {
    fn attach(&self, source_id: &SourceId) -> io::Result<InstanceOutput> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("output of {source_id} is no longer available"),
                )
            })
    }
}
