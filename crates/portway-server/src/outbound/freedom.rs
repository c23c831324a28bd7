//! Direct outbound: dials the destination itself.

use super::policy::{ConnectionGuard, DestinationPolicy, PolicyEnforcer};
use super::resolver::{self, DomainStrategy};
use portway_core::{BoxFuture, Destination, Dispatcher, Link, Network, ProxyError, ProxyResult, Session};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FreedomConfig {
    pub policy: DestinationPolicy,
    pub domain_strategy: DomainStrategy,
    pub connect_timeout: Duration,
}

impl Default for FreedomConfig {
    fn default() -> Self {
        Self {
            policy: DestinationPolicy::default(),
            domain_strategy: DomainStrategy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Dispatcher that dials every destination directly over TCP.
///
/// Each dispatched link holds one connection slot of the [`PolicyEnforcer`]
/// until its reader is dropped.
pub struct Freedom {
    /// Destination allowlist and connection ceiling.
    enforcer: PolicyEnforcer,
    /// How domain destinations are resolved before dialing.
    domain_strategy: DomainStrategy,
    /// Upper bound for each individual connect attempt.
    connect_timeout: Duration,
}

impl Freedom {
    /// Create a dispatcher from its outbound configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Allowlist, connection ceiling, domain strategy and
    ///   connect timeout.
    pub fn new(config: FreedomConfig) -> Self {
        Self {
            enforcer: PolicyEnforcer::new(config.policy),
            domain_strategy: config.domain_strategy,
            connect_timeout: config.connect_timeout,
        }
    }

    pub fn active_connections(&self) -> usize {
        self.enforcer.active_connections()
    }

    /// Check the policy, resolve and dial `destination`.
    ///
    /// # Errors
    ///
    /// * [`ProxyError::Dispatch`] when the destination is not TCP, is not on
    ///   the allowlist, or the connection ceiling is reached.
    /// * [`ProxyError::Io`] when resolution or every connect attempt fails.
    /// * [`ProxyError::Timeout`] when the last attempt timed out.
    async fn open(&self, session: &Session, destination: Destination) -> ProxyResult<Link> {
        if destination.network != Network::Tcp {
            return Err(ProxyError::Dispatch(format!(
                "{} relay is not supported",
                destination.network
            )));
        }
        self.enforcer.check(&destination).map_err(ProxyError::Dispatch)?;
        let guard = self.enforcer.try_acquire().map_err(ProxyError::Dispatch)?;

        let addrs = resolver::resolve(&destination, self.domain_strategy).await?;
        let stream = self.connect_any(&addrs).await?;
        let _ = stream.set_nodelay(true);
        info!(
            session = %session.id,
            destination = %destination,
            peer = ?stream.peer_addr().ok(),
            "outbound connection established"
        );

        let (reader, writer) = stream.into_split();
        Ok(Link::new(
            Guarded {
                inner: reader,
                _guard: guard,
            },
            writer,
        ))
    }

    /// Dial each address in turn; the last error wins.
    async fn connect_any(&self, addrs: &[std::net::SocketAddr]) -> ProxyResult<TcpStream> {
        let mut last = ProxyError::Dispatch("no address to dial".into());
        for addr in addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    debug!(addr = %addr, error = %e, "connect failed");
                    last = ProxyError::Io(e);
                }
                Err(_) => {
                    debug!(addr = %addr, "connect timed out");
                    last = ProxyError::Timeout(self.connect_timeout);
                }
            }
        }
        Err(last)
    }
}

impl Dispatcher for Freedom {
    fn dispatch<'a>(
        &'a self,
        session: &'a Session,
        destination: Destination,
    ) -> BoxFuture<'a, ProxyResult<Link>> {
        Box::pin(async move {
            let target = destination.clone();
            self.open(session, destination).await.inspect_err(|e| {
                warn!(session = %session.id, destination = %target, error = %e, "dispatch failed");
            })
        })
    }
}

/// Read half that keeps a connection slot for as long as it lives.
struct Guarded<R> {
    inner: R,
    _guard: ConnectionGuard,
}

impl<R: AsyncRead + Unpin> AsyncRead for Guarded<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portway_core::Address;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn freedom(allowed: &[&str], max: usize) -> Freedom {
        Freedom::new(FreedomConfig {
            policy: DestinationPolicy {
                allowed_destinations: allowed.iter().map(|s| s.to_string()).collect(),
                max_connections: max,
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn dials_and_releases_slot_on_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let out = freedom(&["*"], 4);
        let session = Session::new(CancellationToken::new());
        let dest = Destination::tcp(Address::Ip(addr.ip()), addr.port());
        let mut link = out.dispatch(&session, dest).await.unwrap();
        assert_eq!(out.active_connections(), 1);

        link.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        link.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(link);
        assert_eq!(out.active_connections(), 0);
    }

    #[tokio::test]
    async fn rejects_disallowed_destination() {
        let out = freedom(&["example.com:443"], 4);
        let session = Session::new(CancellationToken::new());
        let dest = Destination::tcp(Address::parse("10.0.0.1"), 443);
        let err = out.dispatch(&session, dest).await.err().unwrap();
        assert!(matches!(err, ProxyError::Dispatch(_)));
        assert_eq!(err.socks_reply_code(), 0x02);
        assert_eq!(out.active_connections(), 0);
    }

    #[tokio::test]
    async fn rejects_over_connection_cap() {
        let out = freedom(&["*"], 0);
        let session = Session::new(CancellationToken::new());
        let dest = Destination::tcp(Address::parse("127.0.0.1"), 9);
        let err = out.dispatch(&session, dest).await.err().unwrap();
        assert!(err.to_string().contains("connection limit"));
    }

    #[tokio::test]
    async fn refused_connection_maps_to_refused_reply() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let out = freedom(&["*"], 4);
        let session = Session::new(CancellationToken::new());
        let dest = Destination::tcp(Address::parse("127.0.0.1"), port);
        let err = out.dispatch(&session, dest).await.err().unwrap();
        assert_eq!(err.socks_reply_code(), 0x05);
        assert_eq!(out.active_connections(), 0);
    }

    #[tokio::test]
    async fn udp_is_not_dialed() {
        let out = freedom(&["*"], 4);
        let session = Session::new(CancellationToken::new());
        let dest = Destination::udp(Address::parse("127.0.0.1"), 53);
        let err = out.dispatch(&session, dest).await.err().unwrap();
        assert!(matches!(err, ProxyError::Dispatch(_)));
    }
}
