//! Parallel, fail-fast task execution.
//!
//! [`run`] drives a set of independent fallible operations concurrently and
//! returns as soon as the first one fails, the cancellation token fires, or
//! every operation has succeeded. Operations still pending when `run`
//! returns keep running; callers interrupt whatever they block on.

use crate::error::{ProxyError, ProxyResult};
use crate::signal::Semaphore;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A zero-argument fallible operation, started when first polled.
pub type Task = Pin<Box<dyn Future<Output = ProxyResult<()>> + Send + 'static>>;

/// Box a future as a [`Task`].
pub fn task<F>(fut: F) -> Task
where
    F: Future<Output = ProxyResult<()>> + Send + 'static,
{
    Box::pin(fut)
}

/// Run `f`, then `g` only if `f` succeeded.
pub fn on_success(f: Task, g: Task) -> Task {
    Box::pin(async move {
        f.await?;
        g.await
    })
}

/// Run every task concurrently and return the first error, or `Ok(())` once
/// all of them have succeeded.
pub async fn run(cancel: &CancellationToken, tasks: Vec<Task>) -> ProxyResult<()> {
    let n = tasks.len();
    run_bounded(cancel, n, tasks).await
}

/// Like [`run`], with at most `limit` tasks in flight at once.
pub async fn run_bounded(
    cancel: &CancellationToken,
    limit: usize,
    tasks: Vec<Task>,
) -> ProxyResult<()> {
    let n = tasks.len();
    if n == 0 {
        return Ok(());
    }
    let limit = limit.clamp(1, n);
    let tickets = Arc::new(Semaphore::new(limit));
    // Single slot: the first error wins, later ones are dropped.
    let (done_tx, mut done_rx) = mpsc::channel::<ProxyError>(1);

    for t in tasks {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            Some(err) = done_rx.recv() => return Err(err),
            _ = tickets.wait() => {}
        }

        let tickets = tickets.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            match t.await {
                Ok(()) => tickets.signal(),
                Err(err) => {
                    let _ = done_tx.try_send(err);
                }
            }
        });
    }
    drop(done_tx);

    // Every ticket back means every task returned successfully.
    for _ in 0..limit {
        tokio::select! {
            Some(err) = done_rx.recv() => return Err(err),
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            _ = tickets.wait() => {}
        }
    }

    Ok(())
}
