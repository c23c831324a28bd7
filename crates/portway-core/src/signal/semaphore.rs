//! Ticket semaphore with explicit wait/signal.

/// Holds a fixed number of tickets. [`wait`](Semaphore::wait) takes one,
/// blocking while none are available; [`signal`](Semaphore::signal) returns
/// one.
#[derive(Debug)]
pub struct Semaphore {
    inner: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new(tickets: usize) -> Self {
        Self {
            inner: tokio::sync::Semaphore::new(tickets),
        }
    }

    /// Take one ticket, waiting until one is available.
    pub async fn wait(&self) {
        // The inner semaphore is never closed, so acquire cannot fail.
        if let Ok(permit) = self.inner.acquire().await {
            permit.forget();
        }
    }

    /// Return one ticket.
    pub fn signal(&self) {
        self.inner.add_permits(1);
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }
}
