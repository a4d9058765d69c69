//! Stdin source, for piping an existing process into spewguard.

use spewguard_core::{Attach, InstanceOutput, SourceId};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// Attaches this process's stdin as the stdout stream of one source.
/// Stdin cannot be reopened, so only the first attach succeeds.
#[derive(Debug, Default)]
pub struct StdinAttacher {
    taken: AtomicBool,
}

impl StdinAttacher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attach for StdinAttacher {
    fn attach(&self, source_id: &SourceId) -> io::Result<InstanceOutput> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("stdin for {source_id} was already attached"),
            ));
        }
        Ok(InstanceOutput::stdout_only(tokio::io::stdin()))
    }
}
