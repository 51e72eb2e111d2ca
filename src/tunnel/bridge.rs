//! Full-duplex copy between two byte streams.

use crate::error::is_connection_closed;
use log::{debug, warn};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUF_SIZE: usize = 8 * 1024;

/// Bytes moved in each direction by [`bridge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Bytes read from `a` and written to `b`.
    pub a_to_b: u64,
    /// Bytes read from `b` and written to `a`.
    pub b_to_a: u64,
}

/// Copy `a → b` and `b → a` concurrently until both directions end.
///
/// Each direction stops on its own at end of stream or on error, then shuts
/// down its destination. The other direction is left alone; it ends once its
/// own source does.
pub async fn bridge<A, B>(a: A, b: B) -> BridgeStats
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        pump("a->b", a_read, b_write),
        pump("b->a", b_read, a_write),
    );
    BridgeStats { a_to_b, b_to_a }
}

async fn pump<R, W>(direction: &'static str, mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("{}: end of stream after {} bytes", direction, total);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log_end(direction, "read", &e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            log_end(direction, "write", &e);
            break;
        }
        total += n as u64;
    }

    if let Err(e) = writer.shutdown().await {
        log_end(direction, "shutdown", &e);
    }
    total
}

fn log_end(direction: &str, op: &str, e: &io::Error) {
    if is_connection_closed(e) {
        debug!("{}: connection closed during {}", direction, op);
    } else {
        warn!("{}: {} failed: {}", direction, op, e);
    }
}
