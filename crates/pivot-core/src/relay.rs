//! Bidirectional byte relay.
//!
//! Splices two streams until both directions have seen EOF or an error.
//! EOF on one read half is propagated as a shutdown of the opposite write
//! half, so half-close works end to end. I/O errors end the affected
//! direction and are logged, never propagated.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::constants::RELAY_BUFFER_SIZE;

/// Splice two bidirectional streams. Returns once both directions are done;
/// both write halves have been shut down by then.
pub async fn start_relay<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    relay_split(ar, aw, br, bw).await;
}

/// Splice two streams given as separate halves (QUIC sessions hand these
/// out pre-split).
pub async fn relay_split<AR, AW, BR, BW>(ar: AR, aw: AW, br: BR, bw: BW)
where
    AR: AsyncRead + Unpin,
    AW: AsyncWrite + Unpin,
    BR: AsyncRead + Unpin,
    BW: AsyncWrite + Unpin,
{
    tokio::join!(pump(ar, bw), pump(br, aw));
}

/// Copy one direction until EOF or error, then shut down the write side.
async fn pump<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!(error = %e, "relay write ended");
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "relay read ended");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

// =============================================================================
// Tests
// =============================================================================
