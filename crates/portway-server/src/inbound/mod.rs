//! Inbound listeners.

pub mod worker;

#[cfg(unix)]
pub use worker::UnixWorker;
pub use worker::{TcpWorker, Worker, WorkerSettings};
