//! SOCKS 5 inbound handler: negotiation, dispatch and two-way relay.

use super::protocol::{self, Command, ServerSession, REPLY_SUCCEEDED};
use super::ServerConfig;
use portway_core::buf;
use portway_core::session::MemoryUser;
use portway_core::task;
use portway_core::{
    AccessLog, AccessMessage, AccessStatus, BoxConnection, BoxFuture, Connection, Destination,
    Dispatcher, IdleTimer, InboundHandler, Network, PolicyManager, ProxyError, ProxyResult,
    Session, SessionPolicy,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Server {
    config: ServerConfig,
    policy: Arc<PolicyManager>,
    access: Arc<dyn AccessLog>,
    networks: Vec<Network>,
}

impl Server {
    pub fn new(config: ServerConfig, policy: Arc<PolicyManager>, access: Arc<dyn AccessLog>) -> Self {
        if config.timeout.is_some() {
            warn!("socks `timeout` is deprecated, use policy levels instead");
        }
        let mut networks = vec![Network::Tcp];
        if config.udp_enabled {
            networks.push(Network::Udp);
        }
        Self {
            config,
            policy,
            access,
            networks,
        }
    }

    /// Effective policy for this inbound's user level. The deprecated
    /// `timeout` only applies to level 0.
    pub fn policy(&self) -> SessionPolicy {
        let mut policy = self.policy.for_level(self.config.user_level);
        if let Some(timeout) = self.config.timeout {
            if self.config.user_level == 0 {
                policy.timeouts.connection_idle = timeout;
            }
        }
        policy
    }

    async fn process_stream(
        &self,
        mut session: Session,
        mut conn: BoxConnection,
        dispatcher: &dyn Dispatcher,
    ) -> ProxyResult<()> {
        let policy = self.policy();
        let local_ip = conn.local_destination().and_then(|d| d.address.ip());
        let gateway_port = session.inbound.gateway.as_ref().map_or(0, |g| g.port);
        let server_session = ServerSession::new(&self.config, local_ip, gateway_port);

        let handshake = server_session.handshake(&mut conn);
        let request = match tokio::time::timeout(policy.timeouts.handshake, handshake).await {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => {
                self.record(&session, None, AccessStatus::Rejected, err.to_string());
                return Err(err.context("failed to read request"));
            }
            Err(_) => {
                let err = ProxyError::Timeout(policy.timeouts.handshake);
                self.record(&session, None, AccessStatus::Rejected, err.to_string());
                return Err(err.context("failed to read request"));
            }
        };
        if let Some(user) = request.user {
            session.inbound.user.email = user;
        }

        match request.command {
            Command::Connect => {
                debug!(session = %session.id, destination = %request.destination, "TCP connect request");
                self.transport(&mut session, conn, request.destination, dispatcher, &policy)
                    .await
            }
            Command::UdpAssociate => {
                let bind = server_session.udp_bind_destination();
                protocol::write_reply(&mut conn, REPLY_SUCCEEDED, &bind).await?;
                debug!(session = %session.id, bind = %bind, "UDP associate established");
                hold_control_channel(conn, session.token()).await
            }
        }
    }

    async fn transport(
        &self,
        session: &mut Session,
        mut conn: BoxConnection,
        destination: Destination,
        dispatcher: &dyn Dispatcher,
        policy: &SessionPolicy,
    ) -> ProxyResult<()> {
        if !destination.is_valid() {
            let err = ProxyError::Dispatch(format!("invalid destination {destination}"));
            self.record(session, Some(destination), AccessStatus::Rejected, err.to_string());
            protocol::write_reply(&mut conn, err.socks_reply_code(), &protocol::unspecified())
                .await?;
            return Err(err);
        }

        let token = session.child_token();
        let _stop_timer = token.clone().drop_guard();
        let timer = IdleTimer::cancel_after_inactivity(token.clone(), policy.timeouts.connection_idle);
        session.inbound.timer = Some(timer.clone());

        let link = match dispatcher.dispatch(session, destination.clone()).await {
            Ok(link) => link,
            Err(err) => {
                self.record(session, Some(destination), AccessStatus::Rejected, err.to_string());
                // The client may already be gone; the dispatch error is what matters.
                let _ = protocol::write_reply(
                    &mut conn,
                    err.socks_reply_code(),
                    &protocol::unspecified(),
                )
                .await;
                return Err(err);
            }
        };
        protocol::write_reply(&mut conn, REPLY_SUCCEEDED, &protocol::unspecified()).await?;
        self.record(session, Some(destination), AccessStatus::Accepted, String::new());

        let interrupter = link.interrupter();
        let (mut link_reader, link_writer) = link.into_split();
        let link_writer = Arc::new(tokio::sync::Mutex::new(link_writer));
        let (mut client_reader, mut client_writer) = tokio::io::split(conn);
        let buffer_size = policy.buffer.per_connection;

        let upload = {
            let timer = timer.clone();
            let token = token.clone();
            let writer = link_writer.clone();
            let downlink_only = policy.timeouts.downlink_only;
            task::task(async move {
                let mut writer = writer.lock().await;
                let copied =
                    buf::copy(&mut client_reader, &mut *writer, buffer_size, Some(&timer), &token)
                        .await;
                timer.set_timeout(downlink_only);
                copied
                    .map(|_| ())
                    .map_err(|e| ProxyError::from(e).context("failed to transport all TCP request"))
            })
        };

        let close_writer = {
            let writer = link_writer.clone();
            task::task(async move {
                writer
                    .lock()
                    .await
                    .shutdown()
                    .await
                    .map_err(|e| ProxyError::from(e).context("failed to close link"))
            })
        };

        let download = {
            let timer = timer.clone();
            let token = token.clone();
            let uplink_only = policy.timeouts.uplink_only;
            task::task(async move {
                let copied =
                    buf::copy(&mut link_reader, &mut client_writer, buffer_size, Some(&timer), &token)
                        .await;
                timer.set_timeout(uplink_only);
                copied.map_err(|e| {
                    ProxyError::from(e).context("failed to transport all TCP response")
                })?;
                // Half-close so the client sees the end of the response.
                let _ = client_writer.shutdown().await;
                Ok(())
            })
        };

        let result = task::run(&token, vec![task::on_success(upload, close_writer), download]).await;
        if let Err(err) = result {
            interrupter.interrupt();
            token.cancel();
            return Err(err.context("connection ends"));
        }
        Ok(())
    }

    fn record(
        &self,
        session: &Session,
        to: Option<Destination>,
        status: AccessStatus,
        reason: String,
    ) {
        self.access.record(AccessMessage {
            session: session.id,
            from: session.inbound.source.clone(),
            to,
            status,
            reason,
            inbound_tag: session.inbound.tag.clone(),
            email: session.inbound.user.email.clone(),
        });
    }
}

/// The TCP connection of a UDP association only keeps the association
/// alive. Drain it until the client closes it or the session is cancelled.
async fn hold_control_channel(
    mut conn: BoxConnection,
    token: &CancellationToken,
) -> ProxyResult<()> {
    let mut sink = [0u8; 512];
    loop {
        tokio::select! {
            _ = token.cancelled() => return Err(ProxyError::Cancelled),
            read = conn.read(&mut sink) => {
                if read? == 0 {
                    return Ok(());
                }
            }
        }
    }
}

impl InboundHandler for Server {
    fn networks(&self) -> &[Network] {
        &self.networks
    }

    fn process<'a>(
        &'a self,
        mut session: Session,
        network: Network,
        conn: BoxConnection,
        dispatcher: &'a dyn Dispatcher,
    ) -> BoxFuture<'a, ProxyResult<()>> {
        Box::pin(async move {
            session.inbound.name = "socks";
            session.inbound.user = MemoryUser {
                level: self.config.user_level,
                email: String::new(),
            };
            match network {
                Network::Tcp | Network::Unix => {
                    self.process_stream(session, conn, dispatcher).await
                }
                Network::Udp => Err(ProxyError::Other(format!("unknown network: {network}"))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemoryAccessLog, PipeDispatcher, RejectingDispatcher};
    use portway_core::stat::{CounterConnection, StatsManager};
    use portway_core::{Address, Connection, Link, Timeouts};
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
    use tokio_util::sync::CancellationToken;

    fn server_with(policy: PolicyManager, access: Arc<MemoryAccessLog>) -> Server {
        Server::new(ServerConfig::default(), Arc::new(policy), access)
    }

    fn session() -> Session {
        session_under(CancellationToken::new())
    }

    fn session_under(token: CancellationToken) -> Session {
        let mut session = Session::new(token);
        session.inbound.source = Some(Destination::tcp(Address::parse("10.1.1.1"), 40000));
        session.inbound.gateway = Some(Destination::tcp(Address::parse("127.0.0.1"), 1080));
        session.inbound.tag = "socks-in".into();
        session
    }

    async fn negotiate_connect(client: &mut DuplexStream, ip: [u8; 4], port: u16) -> [u8; 10] {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selected = [0u8; 2];
        client.read_exact(&mut selected).await.unwrap();
        assert_eq!(selected, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&ip);
        req.extend_from_slice(&port.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn connect_relays_and_meters_both_directions() {
        let access = Arc::new(MemoryAccessLog::default());
        let server = server_with(PolicyManager::default(), access.clone());
        let (dispatcher, mut remotes) = PipeDispatcher::new();

        let stats = StatsManager::new();
        let up = stats.register_counter("up");
        let down = stats.register_counter("down");
        let (mut client, server_side) = duplex(64 * 1024);
        let conn: BoxConnection = Box::new(CounterConnection::new(
            server_side,
            Some(up.clone()),
            Some(down.clone()),
        ));

        let handle = tokio::spawn(async move {
            server
                .process(session(), Network::Tcp, conn, &dispatcher)
                .await
        });

        let reply = negotiate_connect(&mut client, [93, 184, 216, 34], 80).await;
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        let (destination, mut remote) = remotes.recv().await.unwrap();
        assert_eq!(destination, Destination::tcp(Address::parse("93.184.216.34"), 80));

        // Count only the relayed payload from here on.
        let handshake_up = up.value();
        let handshake_down = down.value();

        let request = vec![0x42u8; 5000];
        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();
        let mut got = Vec::new();
        remote.reader.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, request);

        let response = vec![0x24u8; 7000];
        remote.writer.write_all(&response).await.unwrap();
        remote.writer.shutdown().await.unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, response);

        handle.await.unwrap().unwrap();
        assert_eq!(up.value() - handshake_up, request.len() as i64);
        assert_eq!(down.value() - handshake_down, response.len() as i64);
        assert_eq!(handshake_up, 3 + 10);
        assert_eq!(handshake_down, 2 + 10);

        let events = access.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AccessStatus::Accepted);
        assert_eq!(events[0].inbound_tag, "socks-in");
    }

    #[tokio::test]
    async fn rejected_dispatch_records_destination() {
        let access = Arc::new(MemoryAccessLog::default());
        let server = server_with(PolicyManager::default(), access.clone());
        let dispatcher = RejectingDispatcher;
        let (mut client, server_side) = duplex(4096);

        let handle = tokio::spawn(async move {
            server
                .process(session(), Network::Tcp, Box::new(server_side), &dispatcher)
                .await
        });

        let reply = negotiate_connect(&mut client, [10, 9, 8, 7], 443).await;
        assert_eq!(reply[1], 0x02);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::Dispatch(_)));
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let events = access.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AccessStatus::Rejected);
        assert_eq!(
            events[0].to,
            Some(Destination::tcp(Address::parse("10.9.8.7"), 443))
        );
    }

    #[tokio::test]
    async fn handshake_failure_is_recorded() {
        let access = Arc::new(MemoryAccessLog::default());
        let server = server_with(PolicyManager::default(), access.clone());
        let (dispatcher, _remotes) = PipeDispatcher::new();
        let (mut client, server_side) = duplex(4096);
        client.write_all(&[0x04, 0x01, 0x00, 0x50]).await.unwrap();

        let err = server
            .process(session(), Network::Tcp, Box::new(server_side), &dispatcher)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to read request"));
        let events = access.events();
        assert_eq!(events[0].status, AccessStatus::Rejected);
        assert_eq!(events[0].to, None);
    }

    #[tokio::test]
    async fn silent_client_hits_handshake_timeout() {
        let mut default = SessionPolicy::default();
        default.timeouts.handshake = Duration::from_millis(50);
        let access = Arc::new(MemoryAccessLog::default());
        let server = server_with(PolicyManager::new(default), access);
        let (dispatcher, _remotes) = PipeDispatcher::new();
        let (_client, server_side) = duplex(4096);

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            server.process(session(), Network::Tcp, Box::new(server_side), &dispatcher),
        )
        .await
        .expect("handshake must be bounded")
        .unwrap_err();
        assert_eq!(err.socks_reply_code(), 0x06);
    }

    #[tokio::test]
    async fn idle_relay_is_cancelled() {
        let mut default = SessionPolicy::default();
        default.timeouts = Timeouts {
            connection_idle: Duration::from_millis(100),
            ..Timeouts::default()
        };
        let access = Arc::new(MemoryAccessLog::default());
        let server = server_with(PolicyManager::new(default), access);
        let (dispatcher, mut remotes) = PipeDispatcher::new();
        let (mut client, server_side) = duplex(4096);

        let handle = tokio::spawn(async move {
            server
                .process(session(), Network::Tcp, Box::new(server_side), &dispatcher)
                .await
        });
        negotiate_connect(&mut client, [1, 1, 1, 1], 53).await;
        let _remote = remotes.recv().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("idle timer must end the relay")
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled(), "{err}");
    }

    /// A connection whose reads start failing once `broken` is set.
    struct Breakable {
        inner: DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl AsyncRead for Breakable {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.broken.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Breakable {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl Connection for Breakable {
        fn local_destination(&self) -> Option<Destination> {
            None
        }

        fn remote_destination(&self) -> Option<Destination> {
            None
        }
    }

    #[tokio::test]
    async fn failed_upload_interrupts_download() {
        let access = Arc::new(MemoryAccessLog::default());
        let server = server_with(PolicyManager::default(), access);
        let (dispatcher, mut remotes) = PipeDispatcher::new();
        let (mut client, server_side) = duplex(4096);
        let broken = Arc::new(AtomicBool::new(false));
        let conn = Breakable {
            inner: server_side,
            broken: broken.clone(),
        };

        let handle = tokio::spawn(async move {
            server
                .process(session(), Network::Tcp, Box::new(conn), &dispatcher)
                .await
        });
        negotiate_connect(&mut client, [8, 8, 8, 8], 80).await;
        let (_, remote): (Destination, Link) = remotes.recv().await.unwrap();

        // The remote never answers, so the download would block forever.
        broken.store(true, Ordering::SeqCst);
        client.write_all(b"x").await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("download must be interrupted")
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().starts_with("connection ends"), "{err}");
        drop(remote);
    }

    #[tokio::test]
    async fn udp_associate_replies_with_gateway_and_holds_channel() {
        let access = Arc::new(MemoryAccessLog::default());
        let config = ServerConfig {
            udp_enabled: true,
            address: Some("127.0.0.1".parse().unwrap()),
            ..Default::default()
        };
        let server = Server::new(config, Arc::new(PolicyManager::default()), access);
        assert_eq!(server.networks(), &[Network::Tcp, Network::Udp]);
        let (dispatcher, _remotes) = PipeDispatcher::new();
        let (mut client, server_side) = duplex(4096);

        let handle = tokio::spawn(async move {
            server
                .process(session(), Network::Tcp, Box::new(server_side), &dispatcher)
                .await
        });
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut out = [0u8; 12];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out[2..], &[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]);

        client.write_all(b"keepalive").await.unwrap();
        assert!(!handle.is_finished());
        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn udp_association_ends_when_session_is_cancelled() {
        let access = Arc::new(MemoryAccessLog::default());
        let config = ServerConfig {
            udp_enabled: true,
            ..Default::default()
        };
        let server = Server::new(config, Arc::new(PolicyManager::default()), access);
        let (dispatcher, _remotes) = PipeDispatcher::new();
        let (mut client, server_side) = duplex(4096);
        let root = CancellationToken::new();
        let session = session_under(root.child_token());

        let handle = tokio::spawn(async move {
            server
                .process(session, Network::Tcp, Box::new(server_side), &dispatcher)
                .await
        });
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut out = [0u8; 12];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(out[3], REPLY_SUCCEEDED);

        root.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancellation must end the association")
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        drop(client);
    }

    async fn connect_to_unusable(request: &[u8], expected: Destination) {
        let access = Arc::new(MemoryAccessLog::default());
        let server = server_with(PolicyManager::default(), access.clone());
        let (dispatcher, mut remotes) = PipeDispatcher::new();
        let (mut client, server_side) = duplex(4096);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client.write_all(request).await.unwrap();

        let err = server
            .process(session(), Network::Tcp, Box::new(server_side), &dispatcher)
            .await
            .unwrap_err();
        assert_eq!(err.socks_reply_code(), 0x02);

        let mut out = [0u8; 12];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(out, [0x05, 0x00, 0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(remotes.try_recv().is_err(), "nothing may be dispatched");

        let events = access.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AccessStatus::Rejected);
        assert_eq!(events[0].to, Some(expected));
    }

    #[tokio::test]
    async fn zero_port_is_rejected_without_dispatch() {
        connect_to_unusable(
            &[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x00],
            Destination::tcp(Address::parse("1.2.3.4"), 0),
        )
        .await;
    }

    #[tokio::test]
    async fn empty_domain_is_rejected_without_dispatch() {
        connect_to_unusable(
            &[0x05, 0x01, 0x00, 0x03, 0x00, 0x00, 0x50],
            Destination::tcp(Address::Domain(String::new()), 80),
        )
        .await;
    }

    #[test]
    fn deprecated_timeout_applies_to_level_zero_only() {
        let access: Arc<dyn AccessLog> = Arc::new(MemoryAccessLog::default());
        let config = ServerConfig {
            timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let server = Server::new(config.clone(), Arc::new(PolicyManager::default()), access.clone());
        assert_eq!(server.policy().timeouts.connection_idle, Duration::from_secs(30));

        let config = ServerConfig {
            user_level: 2,
            ..config
        };
        let server = Server::new(config, Arc::new(PolicyManager::default()), access);
        assert_eq!(server.policy().timeouts.connection_idle, Duration::from_secs(300));
    }
}
