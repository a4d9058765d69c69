//! Load generator: floods a writer with random bytes.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::io::{AsyncWrite, AsyncWriteExt};

const CHUNK_BYTES: usize = 64 * 1024;

pub fn message(bytes: u64) -> String {
    format!("Just wrote {bytes} random bytes to the log")
}

/// Write exactly `bytes` random bytes to `writer`, returning the report
/// message once they are flushed.
pub async fn spew<W>(writer: &mut W, bytes: u64) -> std::io::Result<String>
where
    W: AsyncWrite + Unpin,
{
    let mut rng = StdRng::from_entropy();
    let mut chunk = vec![0u8; CHUNK_BYTES];
    let mut remaining = bytes;
    while remaining > 0 {
        let len = remaining.min(CHUNK_BYTES as u64) as usize;
        rng.fill_bytes(&mut chunk[..len]);
        writer.write_all(&chunk[..len]).await?;
        remaining -= len as u64;
    }
    writer.flush().await?;
    tracing::debug!(bytes, "spew: done");
    Ok(message(bytes))
}
