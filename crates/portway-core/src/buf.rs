//! Chunked copy that reports activity and honours cancellation.

use crate::signal::IdleTimer;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Default chunk size for relay copies.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Copy `reader` into `writer` until EOF.
///
/// Each non-empty chunk is written in full and flushed, then `activity` (if
/// any) is updated. A fired `cancel` token aborts the copy with
/// [`io::ErrorKind::Interrupted`] even while a read or write is blocked.
/// Returns the number of bytes copied.
pub async fn copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    activity: Option<&IdleTimer>,
    cancel: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            r = reader.read(&mut buf) => r?,
        };
        if n == 0 {
            return Ok(total);
        }
        if let Some(timer) = activity {
            timer.update();
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            r = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            } => r?,
        }
        total += n as u64;
        if let Some(timer) = activity {
            timer.update();
        }
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "copy cancelled")
}
