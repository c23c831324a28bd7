//! Inactivity timer that cancels a session when no traffic flows.
//!
//! The timer owns a deadline and a [`CancellationToken`]. Every call to
//! [`IdleTimer::update`] pushes the deadline to `now + timeout`, never
//! backwards; a background task sleeps until the deadline and cancels the
//! token if it has not moved in the meantime.
//!
//! [`IdleTimer::set_timeout`] changes the timeout itself and re-arms the
//! deadline from now. The relay uses it to shorten the timeout once one
//! direction has finished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cloneable handle to a running inactivity timer.
///
/// Safe to update concurrently from any number of tasks.
#[derive(Debug, Clone)]
pub struct IdleTimer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    origin: Instant,
    /// Nanoseconds since `origin`.
    deadline: AtomicU64,
    /// Nanoseconds.
    timeout: AtomicU64,
    rearm: Notify,
}

impl Inner {
    fn now_nanos(&self) -> u64 {
        saturating_nanos(self.origin.elapsed())
    }

    fn deadline(&self) -> Instant {
        let offset = Duration::from_nanos(self.deadline.load(Ordering::Acquire));
        self.origin
            .checked_add(offset)
            .unwrap_or_else(|| self.origin + FAR_FUTURE)
    }
}

/// Stand-in deadline for timeouts too large to represent as an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl IdleTimer {
    /// Start a timer that cancels `token` after `timeout` without activity.
    ///
    /// Must be called from within a Tokio runtime. A zero `timeout` cancels
    /// immediately.
    pub fn cancel_after_inactivity(token: CancellationToken, timeout: Duration) -> Self {
        let timeout_nanos = saturating_nanos(timeout);
        let inner = Arc::new(Inner {
            token,
            origin: Instant::now(),
            deadline: AtomicU64::new(timeout_nanos),
            timeout: AtomicU64::new(timeout_nanos),
            rearm: Notify::new(),
        });

        if timeout.is_zero() {
            inner.token.cancel();
        } else {
            tokio::spawn(watch(inner.clone()));
        }

        Self { inner }
    }

    /// Record activity: move the deadline to `now + timeout` unless it is
    /// already later.
    pub fn update(&self) {
        let next = self
            .inner
            .now_nanos()
            .saturating_add(self.inner.timeout.load(Ordering::Acquire));
        self.inner.deadline.fetch_max(next, Ordering::AcqRel);
    }

    /// Replace the timeout and re-arm the deadline from now. Zero cancels the
    /// session immediately.
    pub fn set_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            self.inner.token.cancel();
            return;
        }
        let nanos = saturating_nanos(timeout);
        self.inner.timeout.store(nanos, Ordering::Release);
        self.inner
            .deadline
            .store(self.inner.now_nanos().saturating_add(nanos), Ordering::Release);
        self.inner.rearm.notify_one();
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.inner.timeout.load(Ordering::Acquire))
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline()
    }
}

async fn watch(inner: Arc<Inner>) {
    loop {
        let deadline = inner.deadline();
        tokio::select! {
            _ = inner.token.cancelled() => return,
            _ = inner.rearm.notified() => continue,
            _ = tokio::time::sleep_until(deadline) => {
                if inner.deadline() <= Instant::now() {
                    debug!(timeout = ?Duration::from_nanos(inner.timeout.load(Ordering::Acquire)), "idle timeout reached");
                    inner.token.cancel();
                    return;
                }
            }
        }
    }
}
