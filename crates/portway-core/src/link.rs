//! The bidirectional path returned by dispatch.
//!
//! A [`Link`] is a reader (bytes coming back from the destination) and a
//! writer (bytes going towards it). Both halves share one interrupt signal:
//! once [`Interrupter::interrupt`] is called, every pending and future read
//! or write on either half fails with [`io::ErrorKind::Interrupted`].

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

fn interrupted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "link interrupted")
}

/// Handle that forces both halves of a link to unblock.
#[derive(Debug, Clone)]
pub struct Interrupter {
    token: CancellationToken,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Polls the shared token so a blocked half is woken on interrupt.
struct InterruptSignal {
    token: CancellationToken,
    wait: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl InterruptSignal {
    fn new(token: CancellationToken) -> Self {
        let wait = Box::pin(token.clone().cancelled_owned());
        Self { token, wait }
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.wait.as_mut().poll(cx).is_ready()
    }
}

/// Inbound byte source of a link.
pub struct LinkReader {
    inner: BoxRead,
    signal: InterruptSignal,
}

impl AsyncRead for LinkReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.signal.poll(cx) {
            return Poll::Ready(Err(interrupted()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// Outbound byte sink of a link.
pub struct LinkWriter {
    inner: BoxWrite,
    signal: InterruptSignal,
}

impl AsyncWrite for LinkWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.signal.poll(cx) {
            return Poll::Ready(Err(interrupted()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.signal.poll(cx) {
            return Poll::Ready(Err(interrupted()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.signal.poll(cx) {
            return Poll::Ready(Err(interrupted()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// A dispatched path to a destination.
pub struct Link {
    pub reader: LinkReader,
    pub writer: LinkWriter,
    token: CancellationToken,
}

impl Link {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let token = CancellationToken::new();
        Self {
            reader: LinkReader {
                inner: Box::new(reader),
                signal: InterruptSignal::new(token.clone()),
            },
            writer: LinkWriter {
                inner: Box::new(writer),
                signal: InterruptSignal::new(token.clone()),
            },
            token,
        }
    }

    /// Two links joined back to back through an in-memory pipe: bytes
    /// written to one end's writer are read from the other end's reader.
    pub fn pipe(max_buf_size: usize) -> (Link, Link) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Link::new(a_read, a_write), Link::new(b_read, b_write))
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            token: self.token.clone(),
        }
    }

    pub fn into_split(self) -> (LinkReader, LinkWriter) {
        (self.reader, self.writer)
    }
}
