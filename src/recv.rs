//! Chunked receive convention shared by the control client, the bridges
//! and the egress probe.
//!
//! The peer protocols here carry no length framing; a message is read in
//! fixed-size chunks and considered complete when a chunk comes back
//! shorter than the read size.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::timeout;

/// Read one message using the short-chunk termination convention.
///
/// Returns `Ok(None)` when the peer closes or times out before any byte
/// arrives, or when `cancel` flips mid-read. A close or timeout after
/// some data has arrived yields the partial message instead of dropping
/// it.
pub(crate) async fn read_until_short<S>(
    stream: &mut S,
    chunk_size: usize,
    read_timeout: Duration,
    cancel: Option<&watch::Receiver<bool>>,
) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut msg = Vec::new();
    let mut buf = vec![0u8; chunk_size];

    loop {
        if cancel.is_some_and(|c| *c.borrow()) {
            return Ok(None);
        }

        let n = match timeout(read_timeout, stream.read(&mut buf)).await {
            // Timeout: give back whatever arrived so far.
            Err(_) => break,
            Ok(Err(e)) => return Err(e),
            // Orderly close.
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
        };

        msg.extend_from_slice(&buf[..n]);
        if n < chunk_size {
            break;
        }
    }

    if msg.is_empty() {
        Ok(None)
    } else {
        Ok(Some(msg))
    }
}
