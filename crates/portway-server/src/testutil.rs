//! Shared fixtures for handler and worker tests.

use portway_core::{
    AccessLog, AccessMessage, BoxFuture, Destination, Dispatcher, Link, ProxyError, ProxyResult,
    Session,
};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Keeps every recorded access event.
#[derive(Default)]
pub struct MemoryAccessLog {
    events: Mutex<Vec<AccessMessage>>,
}

impl MemoryAccessLog {
    pub fn events(&self) -> Vec<AccessMessage> {
        self.events.lock().unwrap().clone()
    }
}

impl AccessLog for MemoryAccessLog {
    fn record(&self, msg: AccessMessage) {
        self.events.lock().unwrap().push(msg);
    }
}

/// Answers every dispatch with one end of an in-memory pipe and hands the
/// other end, with the requested destination, to the test.
pub struct PipeDispatcher {
    remotes: mpsc::UnboundedSender<(Destination, Link)>,
}

impl PipeDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Destination, Link)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { remotes: tx }, rx)
    }
}

impl Dispatcher for PipeDispatcher {
    fn dispatch<'a>(
        &'a self,
        _session: &'a Session,
        destination: Destination,
    ) -> BoxFuture<'a, ProxyResult<Link>> {
        Box::pin(async move {
            let (local, remote) = Link::pipe(64 * 1024);
            self.remotes
                .send((destination, remote))
                .map_err(|_| ProxyError::Dispatch("test receiver dropped".into()))?;
            Ok(local)
        })
    }
}

/// Denies every destination.
pub struct RejectingDispatcher;

impl Dispatcher for RejectingDispatcher {
    fn dispatch<'a>(
        &'a self,
        _session: &'a Session,
        destination: Destination,
    ) -> BoxFuture<'a, ProxyResult<Link>> {
        Box::pin(async move { Err(ProxyError::Dispatch(format!("{destination} is blocked"))) })
    }
}
