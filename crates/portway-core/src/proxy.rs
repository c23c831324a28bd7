//! Inbound handler contract.

use crate::error::ProxyResult;
use crate::net::Network;
use crate::routing::Dispatcher;
use crate::session::Session;
use crate::stat::BoxConnection;
use crate::BoxFuture;

/// A protocol handler fed with accepted connections by a worker.
pub trait InboundHandler: Send + Sync {
    /// Networks this handler accepts connections on.
    fn networks(&self) -> &[Network];

    /// Serve one connection to completion. The connection is closed when
    /// it is dropped.
    fn process<'a>(
        &'a self,
        session: Session,
        network: Network,
        conn: BoxConnection,
        dispatcher: &'a dyn Dispatcher,
    ) -> BoxFuture<'a, ProxyResult<()>>;

    /// Release handler resources.
    fn close(&self) -> ProxyResult<()> {
        Ok(())
    }
}
