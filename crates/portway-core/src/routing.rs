//! The seam between inbound handlers and outbound transports.

use crate::error::ProxyResult;
use crate::link::Link;
use crate::net::Destination;
use crate::session::Session;
use crate::BoxFuture;

/// Turns a destination into a bidirectional [`Link`].
///
/// The returned link's reader yields bytes from the destination and its
/// writer sends bytes to it. A failed dispatch maps to a SOCKS failure
/// reply through [`ProxyError::socks_reply_code`](crate::ProxyError::socks_reply_code).
pub trait Dispatcher: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        session: &'a Session,
        destination: Destination,
    ) -> BoxFuture<'a, ProxyResult<Link>>;
}
