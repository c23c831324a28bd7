//! portway-core: building blocks for the portway proxy.
//!
//! Session context, cancellable links, idle timers, fail-fast task groups,
//! traffic metering, and the traits that join inbound handlers to
//! outbound dispatchers.

pub mod buf;
pub mod error;
pub mod link;
pub mod log;
pub mod net;
pub mod policy;
pub mod proxy;
pub mod routing;
pub mod session;
pub mod signal;
pub mod stat;
pub mod task;

use std::future::Future;
use std::pin::Pin;

/// Boxed future used by the dyn-compatible traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Re-export commonly used items at crate root.
pub use error::{HandshakeStage, ProxyError, ProxyResult};
pub use link::{Interrupter, Link, LinkReader, LinkWriter};
pub use log::{AccessLog, AccessMessage, AccessStatus, NoopAccessLog, TracingAccessLog};
pub use net::{Address, Destination, Network};
pub use policy::{PolicyManager, SessionPolicy, Timeouts};
pub use proxy::InboundHandler;
pub use routing::Dispatcher;
pub use session::{Session, SessionId};
pub use signal::{IdleTimer, Semaphore};
pub use stat::{BoxConnection, Connection, Counter, CounterConnection, StatsManager};
