//! Outbound side: the direct ("freedom") dispatcher.

pub mod freedom;
pub mod policy;
pub mod resolver;

pub use freedom::{Freedom, FreedomConfig};
pub use policy::{DestinationPolicy, PolicyEnforcer};
pub use resolver::DomainStrategy;
