//! Wires the configured pieces together once at startup.

use crate::config::{Config, Listen};
use crate::inbound::{TcpWorker, Worker, WorkerSettings};
use crate::outbound::Freedom;
use crate::socks;
use portway_core::stat::{downlink_counter_name, uplink_counter_name};
use portway_core::{
    AccessLog, Dispatcher, InboundHandler, NoopAccessLog, ProxyError, ProxyResult, StatsManager,
    TracingAccessLog,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A configured proxy: one worker per inbound, sharing the policy manager,
/// stats manager, access log and dispatcher.
pub struct Instance {
    workers: Vec<Box<dyn Worker>>,
    stats: Arc<StatsManager>,
    ctx: CancellationToken,
}

impl Instance {
    pub fn new(config: &Config) -> ProxyResult<Self> {
        let policy = Arc::new(config.policy.clone());
        let stats = Arc::new(StatsManager::new());
        let access: Arc<dyn AccessLog> = if config.access_log {
            Arc::new(TracingAccessLog)
        } else {
            Arc::new(NoopAccessLog)
        };
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(Freedom::new(config.outbound.clone()));
        let ctx = CancellationToken::new();

        let mut workers: Vec<Box<dyn Worker>> = Vec::with_capacity(config.inbounds.len());
        for inbound in &config.inbounds {
            let handler: Arc<dyn InboundHandler> = Arc::new(socks::Server::new(
                inbound.socks.clone(),
                policy.clone(),
                access.clone(),
            ));
            let counters = inbound.stats.then(|| {
                (
                    stats.register_counter(&uplink_counter_name(&inbound.tag)),
                    stats.register_counter(&downlink_counter_name(&inbound.tag)),
                )
            });
            let settings = WorkerSettings {
                tag: inbound.tag.clone(),
                handler,
                dispatcher: dispatcher.clone(),
                counters,
                sniffing: inbound.sniffing.clone(),
                ctx: ctx.clone(),
            };
            let worker: Box<dyn Worker> = match &inbound.listen {
                Listen::Tcp { address, port } => {
                    Box::new(TcpWorker::new(settings, *address, *port, inbound.tproxy))
                }
                #[cfg(unix)]
                Listen::Unix(path) => Box::new(crate::inbound::UnixWorker::new(settings, path.clone())),
                #[cfg(not(unix))]
                Listen::Unix(_) => {
                    return Err(ProxyError::Config(format!(
                        "inbound {}: unix sockets are not supported on this platform",
                        inbound.tag
                    )))
                }
            };
            workers.push(worker);
        }

        Ok(Self {
            workers,
            stats,
            ctx,
        })
    }

    /// Start every worker. On the first failure the workers already started
    /// are closed again and the error is returned.
    pub fn start(&self) -> ProxyResult<()> {
        for (i, worker) in self.workers.iter().enumerate() {
            if let Err(err) = worker.start() {
                for started in &self.workers[..i] {
                    if let Err(e) = started.close() {
                        warn!(tag = %started.tag(), error = %e, "failed to close inbound");
                    }
                }
                return Err(err);
            }
        }
        info!(inbounds = self.workers.len(), "portway started");
        Ok(())
    }

    /// Close every worker and end all live connections.
    pub fn close(&self) -> ProxyResult<()> {
        let errors: Vec<String> = self
            .workers
            .iter()
            .filter_map(|w| w.close().err().map(|e| format!("{}: {e}", w.tag())))
            .collect();
        self.ctx.cancel();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::Other(format!(
                "failed to close all inbounds: {}",
                errors.join("; ")
            )))
        }
    }

    pub fn stats(&self) -> &StatsManager {
        &self.stats
    }

    pub fn workers(&self) -> &[Box<dyn Worker>] {
        &self.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use std::io::Write;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn load(body: &str) -> Config {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        Config::load(Some(f.path()), Overrides::default()).unwrap()
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.into_split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn socks_connect_through_direct_outbound() {
        let echo = echo_server().await;
        let instance = Instance::new(&load(
            "[[inbounds]]\ntag = \"in\"\nport = 0\nstats = true\n",
        ))
        .unwrap();
        instance.start().unwrap();
        let port = instance.workers()[0].port();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selected = [0u8; 2];
        client.read_exact(&mut selected).await.unwrap();
        assert_eq!(selected, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&echo.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        let payload = b"through the proxy and back";
        client.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, payload);

        let up = instance.stats().get_counter("inbound>>>in>>>traffic>>>uplink").unwrap();
        let down = instance.stats().get_counter("inbound>>>in>>>traffic>>>downlink").unwrap();
        assert_eq!(up.value(), (3 + 10 + payload.len()) as i64);
        assert_eq!(down.value(), (2 + 10 + payload.len()) as i64);

        instance.close().unwrap();
        // Live connections end with the instance.
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
        assert!(read.is_ok());
    }

    #[tokio::test]
    async fn failed_start_closes_started_workers() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = taken.local_addr().unwrap().port();
        let instance = Instance::new(&load(&format!(
            "[[inbounds]]\ntag = \"a\"\nport = 0\n\n[[inbounds]]\ntag = \"b\"\nport = {busy}\n"
        )))
        .unwrap();

        let err = instance.start().unwrap_err();
        assert!(matches!(err, ProxyError::Listen { .. }));
        // Worker "a" was closed again, so it reports its configured port.
        assert_eq!(instance.workers()[0].port(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn workers_follow_inbounds() {
        let instance = Instance::new(&load(
            "[[inbounds]]\ntag = \"a\"\nport = 1\n\n[[inbounds]]\ntag = \"b\"\nunix = \"/tmp/b.sock\"\n",
        ))
        .unwrap();
        let tags: Vec<&str> = instance.workers().iter().map(|w| w.tag()).collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert!(instance.stats().snapshot().is_empty());
    }
}
