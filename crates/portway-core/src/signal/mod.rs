//! Synchronisation helpers: a ticket semaphore and the inactivity timer.

pub mod semaphore;
pub mod timer;

pub use semaphore::Semaphore;
pub use timer::IdleTimer;
