//! Callback executor (§4.7, §5): the single-threaded delivery discipline
//! exposed to user code. Receive-handlers, response callbacks, and
//! delegate notifications are all submitted here and run strictly in
//! submission order rather than directly on an I/O task.
//!
//! The source models this as a queue of zero-argument closures; the
//! natural async-Rust counterpart is a bounded `mpsc` channel of boxed
//! futures, drained by one Tokio task that awaits each in turn before
//! pulling the next.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

const QUEUE_CAPACITY: usize = 1024;

pub struct CallbackExecutor {
    tx: mpsc::Sender<BoxFuture<'static, ()>>,
    drain_task: JoinHandle<()>,
}

impl CallbackExecutor {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<BoxFuture<'static, ()>>(QUEUE_CAPACITY);
        let drain_task = tokio::spawn(async move {
            while let Some(future) = rx.recv().await {
                future.await;
            }
        });
        Self { tx, drain_task }
    }

    /// Queue a callback, preserving FIFO order relative to earlier
    /// submissions. Backpressures the caller if the queue is full rather
    /// than dropping, so a slow user handler never silently loses a push.
    pub async fn submit(&self, future: BoxFuture<'static, ()>) {
        if self.tx.send(future).await.is_err() {
            warn!("callback executor: queue closed, dropping callback");
        }
    }
}

impl Default for CallbackExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackExecutor {
    fn drop(&mut self) {
        self.drain_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn callbacks_run_in_submission_order() {
        let executor = CallbackExecutor::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            executor
                .submit(Box::pin(async move {
                    order.lock().await.push(i);
                }))
                .await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn callback_runs_exactly_once() {
        let executor = CallbackExecutor::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        executor
            .submit(Box::pin(async move {
                count_clone.fetch_add(1, Ordering::Relaxed);
            }))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
