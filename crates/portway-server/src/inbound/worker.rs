//! Listener workers.
//!
//! A worker owns one bound socket. Its accept loop runs in a spawned task
//! and hands every accepted connection to its own task, which builds the
//! [`Session`] and runs the protocol handler. Connection failures stay in
//! that task; only bind errors reach the caller of [`Worker::start`].

use crate::sockopt::{self, TproxyMode};
use portway_core::session::SniffingRequest;
use portway_core::{
    Address, BoxConnection, Connection, Counter, CounterConnection, Destination, Dispatcher,
    InboundHandler, Network, ProxyError, ProxyResult, Session,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed accept, so a persistent error such as fd
/// exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A listener that can be started and stopped.
pub trait Worker: Send + Sync {
    /// Bind and begin accepting.
    fn start(&self) -> ProxyResult<()>;
    /// Stop accepting, release the socket and the handler's resources.
    /// Connections already accepted keep running.
    fn close(&self) -> ProxyResult<()>;
    /// Bound port; zero for domain sockets.
    fn port(&self) -> u16;
    fn tag(&self) -> &str;
}

/// Everything a worker hands to each connection.
pub struct WorkerSettings {
    /// Inbound tag, copied into every session and access record.
    pub tag: String,
    /// Protocol handler that negotiates and relays each connection.
    pub handler: Arc<dyn InboundHandler>,
    /// Opens the outbound side once the handler knows the destination.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Uplink and downlink traffic counters.
    pub counters: Option<(Arc<dyn Counter>, Arc<dyn Counter>)>,
    /// Sniffing directives passed through to each session.
    pub sniffing: SniffingRequest,
    /// Long-lived parent of every connection's token.
    pub ctx: CancellationToken,
}

impl WorkerSettings {
    /// Build the session for one accepted connection and serve it in its
    /// own task.
    ///
    /// # Arguments
    ///
    /// * `network` - Transport the connection arrived on.
    /// * `conn` - The accepted connection, wrapped for metering when
    ///   counters are configured.
    /// * `source` - Peer address, if known.
    /// * `gateway` - Local address the listener is bound to.
    /// * `target` - Destination recovered from the socket in transparent
    ///   mode. Unusable values such as port zero are discarded.
    fn serve(
        self: &Arc<Self>,
        network: Network,
        conn: BoxConnection,
        source: Option<Destination>,
        gateway: Destination,
        target: Option<Destination>,
    ) {
        let token = self.ctx.child_token();
        let mut session = Session::new(token.clone());
        session.inbound.source = source;
        session.inbound.gateway = Some(gateway);
        session.inbound.tag = self.tag.clone();
        session.outbound.target = target.filter(Destination::is_valid);
        session.content.sniffing = self.sniffing.clone();
        let id = session.id;

        let conn: BoxConnection = match &self.counters {
            Some((up, down)) => Box::new(CounterConnection::new(
                conn,
                Some(up.clone()),
                Some(down.clone()),
            )),
            None => conn,
        };

        debug!(session = %id, tag = %self.tag, source = ?session.inbound.source, "connection accepted");
        let settings = self.clone();
        tokio::spawn(async move {
            let _cancel = token.drop_guard();
            let result = settings
                .handler
                .process(session, network, conn, settings.dispatcher.as_ref())
                .await;
            match result {
                Ok(()) => debug!(session = %id, "connection closed"),
                Err(e) if e.is_cancelled() => debug!(session = %id, error = %e, "connection cancelled"),
                Err(e) => info!(session = %id, tag = %settings.tag, error = %e, "connection ends"),
            }
        });
    }
}

/// State of a started listener.
struct Running {
    /// The port the OS actually bound (differs from the configured one when
    /// that was zero).
    port: u16,
    /// Stops the accept loop; a child of the worker's context.
    shutdown: CancellationToken,
    accept: JoinHandle<()>,
}

fn stop(state: &Mutex<Option<Running>>) -> bool {
    let running = state.lock().unwrap_or_else(PoisonError::into_inner).take();
    match running {
        Some(r) => {
            r.shutdown.cancel();
            r.accept.abort();
            true
        }
        None => false,
    }
}

/// TCP listener worker.
pub struct TcpWorker {
    settings: Arc<WorkerSettings>,
    /// Local address to bind.
    address: IpAddr,
    /// Configured port; `0` asks the OS for one.
    port: u16,
    /// How to recover the original destination of redirected connections.
    tproxy: TproxyMode,
    /// `Some` while the listener is accepting.
    state: Mutex<Option<Running>>,
}

impl TcpWorker {
    /// Create a stopped worker; nothing is bound until [`Worker::start`].
    ///
    /// # Arguments
    ///
    /// * `settings` - Handler, dispatcher and per-connection settings.
    /// * `address` - Local address to bind (e.g. `127.0.0.1`).
    /// * `port` - TCP port to bind. Use `0` for an OS-assigned port.
    /// * `tproxy` - Original-destination recovery mode.
    pub fn new(settings: WorkerSettings, address: IpAddr, port: u16, tproxy: TproxyMode) -> Self {
        Self {
            settings: Arc::new(settings),
            address,
            port,
            tproxy,
            state: Mutex::new(None),
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        settings: Arc<WorkerSettings>,
        gateway: Destination,
        tproxy: TproxyMode,
        shutdown: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = listener.accept() => r,
            };
            let (stream, peer) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    warn!(tag = %settings.tag, error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let target = match sockopt::recover_original_destination(tproxy, &stream) {
                Ok(target) => target,
                Err(e) => {
                    info!(tag = %settings.tag, peer = %peer, error = %e, "failed to get original destination");
                    None
                }
            };
            let _ = stream.set_nodelay(true);
            let source = Destination::from_socket_addr(Network::Tcp, peer);
            settings.serve(Network::Tcp, Box::new(stream), Some(source), gateway.clone(), target);
        }
        debug!(tag = %settings.tag, "accept loop ended");
    }
}

impl Worker for TcpWorker {
    fn start(&self) -> ProxyResult<()> {
        let addr = SocketAddr::new(self.address, self.port);
        let listen_err = |source| ProxyError::Listen {
            addr: addr.to_string(),
            source,
        };
        let std_listener = std::net::TcpListener::bind(addr).map_err(listen_err)?;
        std_listener.set_nonblocking(true).map_err(listen_err)?;
        let listener = TcpListener::from_std(std_listener).map_err(listen_err)?;
        let port = listener.local_addr().map_err(listen_err)?.port();

        let gateway = Destination::tcp(Address::Ip(self.address), port);
        let shutdown = self.settings.ctx.child_token();
        let accept = tokio::spawn(Self::accept_loop(
            listener,
            self.settings.clone(),
            gateway,
            self.tproxy,
            shutdown.clone(),
        ));
        info!(tag = %self.settings.tag, addr = %SocketAddr::new(self.address, port), "listening TCP");

        let previous = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Running {
                port,
                shutdown,
                accept,
            });
        if let Some(old) = previous {
            old.shutdown.cancel();
            old.accept.abort();
        }
        Ok(())
    }

    fn close(&self) -> ProxyResult<()> {
        if stop(&self.state) {
            info!(tag = %self.settings.tag, "listener closed");
        }
        self.settings.handler.close()
    }

    fn port(&self) -> u16 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(self.port, |r| r.port)
    }

    fn tag(&self) -> &str {
        &self.settings.tag
    }
}

/// Unix domain socket listener worker.
#[cfg(unix)]
pub struct UnixWorker {
    settings: Arc<WorkerSettings>,
    /// Socket file; removed again on close.
    path: PathBuf,
    state: Mutex<Option<Running>>,
}

#[cfg(unix)]
impl UnixWorker {
    pub fn new(settings: WorkerSettings, path: impl Into<PathBuf>) -> Self {
        Self {
            settings: Arc::new(settings),
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    async fn accept_loop(
        listener: tokio::net::UnixListener,
        settings: Arc<WorkerSettings>,
        gateway: Destination,
        shutdown: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((stream, _)) => {
                    let source = stream.remote_destination();
                    settings.serve(Network::Unix, Box::new(stream), source, gateway.clone(), None);
                }
                Err(e) => {
                    warn!(tag = %settings.tag, error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!(tag = %settings.tag, "accept loop ended");
    }
}

#[cfg(unix)]
impl Worker for UnixWorker {
    fn start(&self) -> ProxyResult<()> {
        let listen_err = |source| ProxyError::Listen {
            addr: self.path.display().to_string(),
            source,
        };
        let std_listener = std::os::unix::net::UnixListener::bind(&self.path).map_err(listen_err)?;
        std_listener.set_nonblocking(true).map_err(listen_err)?;
        let listener = tokio::net::UnixListener::from_std(std_listener).map_err(listen_err)?;

        let gateway = Destination::unix(self.path.to_string_lossy());
        let shutdown = self.settings.ctx.child_token();
        let accept = tokio::spawn(Self::accept_loop(
            listener,
            self.settings.clone(),
            gateway,
            shutdown.clone(),
        ));
        info!(tag = %self.settings.tag, path = %self.path.display(), "listening unix");

        let previous = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Running {
                port: 0,
                shutdown,
                accept,
            });
        if let Some(old) = previous {
            old.shutdown.cancel();
            old.accept.abort();
        }
        Ok(())
    }

    fn close(&self) -> ProxyResult<()> {
        if stop(&self.state) {
            // The socket file outlives the listener.
            if let Err(e) = std::fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), error = %e, "failed to remove socket file");
            }
            info!(tag = %self.settings.tag, "listener closed");
        }
        self.settings.handler.close()
    }

    fn port(&self) -> u16 {
        0
    }

    fn tag(&self) -> &str {
        &self.settings.tag
    }
}
