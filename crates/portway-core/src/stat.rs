//! Traffic counters and the metered connection wrapper.

use crate::net::{Destination, Network};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A named monotonically increasing value.
pub trait Counter: Send + Sync {
    /// Add `delta` and return the new value.
    fn add(&self, delta: i64) -> i64;
    fn value(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicI64);

impl Counter for AtomicCounter {
    fn add(&self, delta: i64) -> i64 {
        self.0.fetch_add(delta, Ordering::Relaxed) + delta
    }

    fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of counters by name.
#[derive(Default)]
pub struct StatsManager {
    counters: Mutex<HashMap<String, Arc<AtomicCounter>>>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the counter called `name`.
    pub fn register_counter(&self, name: &str) -> Arc<dyn Counter> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.entry(name.to_string()).or_default().clone();
        counter
    }

    pub fn get_counter(&self, name: &str) -> Option<Arc<dyn Counter>> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = counters.get(name).cloned();
        counter.map(|c| c as Arc<dyn Counter>)
    }

    /// Name/value pairs sorted by name.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = counters
            .iter()
            .map(|(name, c)| (name.clone(), c.value()))
            .collect();
        out.sort();
        out
    }
}

impl fmt::Debug for StatsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

/// Counter name for an inbound's client-to-server bytes.
pub fn uplink_counter_name(tag: &str) -> String {
    format!("inbound>>>{tag}>>>traffic>>>uplink")
}

/// Counter name for an inbound's server-to-client bytes.
pub fn downlink_counter_name(tag: &str) -> String {
    format!("inbound>>>{tag}>>>traffic>>>downlink")
}

/// A bidirectional byte stream accepted from a client.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn local_destination(&self) -> Option<Destination>;
    fn remote_destination(&self) -> Option<Destination>;
}

pub type BoxConnection = Box<dyn Connection>;

impl Connection for tokio::net::TcpStream {
    fn local_destination(&self) -> Option<Destination> {
        self.local_addr()
            .ok()
            .map(|a| Destination::from_socket_addr(Network::Tcp, a))
    }

    fn remote_destination(&self) -> Option<Destination> {
        self.peer_addr()
            .ok()
            .map(|a| Destination::from_socket_addr(Network::Tcp, a))
    }
}

#[cfg(unix)]
impl Connection for tokio::net::UnixStream {
    fn local_destination(&self) -> Option<Destination> {
        let addr = self.local_addr().ok()?;
        let path = addr.as_pathname()?;
        Some(Destination::unix(path.to_string_lossy()))
    }

    fn remote_destination(&self) -> Option<Destination> {
        // Peers of a domain socket are usually unnamed.
        let addr = self.peer_addr().ok()?;
        let path = addr.as_pathname()?;
        Some(Destination::unix(path.to_string_lossy()))
    }
}

impl Connection for tokio::io::DuplexStream {
    fn local_destination(&self) -> Option<Destination> {
        None
    }

    fn remote_destination(&self) -> Option<Destination> {
        None
    }
}

impl Connection for BoxConnection {
    fn local_destination(&self) -> Option<Destination> {
        (**self).local_destination()
    }

    fn remote_destination(&self) -> Option<Destination> {
        (**self).remote_destination()
    }
}

/// Counts bytes flowing through a connection. Bytes read from the client
/// are uplink; bytes written to it are downlink.
pub struct CounterConnection<C> {
    inner: C,
    read_counter: Option<Arc<dyn Counter>>,
    write_counter: Option<Arc<dyn Counter>>,
}

impl<C> CounterConnection<C> {
    pub fn new(
        inner: C,
        read_counter: Option<Arc<dyn Counter>>,
        write_counter: Option<Arc<dyn Counter>>,
    ) -> Self {
        Self {
            inner,
            read_counter,
            write_counter,
        }
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for CounterConnection<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            if n > 0 {
                if let Some(c) = &this.read_counter {
                    c.add(n as i64);
                }
            }
        }
        res
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for CounterConnection<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            if n > 0 {
                if let Some(c) = &this.write_counter {
                    c.add(n as i64);
                }
            }
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<C: Connection> Connection for CounterConnection<C> {
    fn local_destination(&self) -> Option<Destination> {
        self.inner.local_destination()
    }

    fn remote_destination(&self) -> Option<Destination> {
        self.inner.remote_destination()
    }
}
