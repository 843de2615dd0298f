//! Tracking of work that outlives the request that started it.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Inner {
    active: AtomicUsize,
    idle: Notify,
}

/// Spawns tasks and waits until none are running.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

struct ActiveGuard(Arc<Inner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl BackgroundTasks {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `future` on the runtime and tracks it until it finishes or
    /// is aborted.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(Arc::clone(&self.inner));
        tokio::spawn(async move {
            let _guard = guard;
            future.await
        })
    }

    /// Number of tracked tasks still running.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Waits until no tracked task is running, including tasks spawned
    /// while waiting.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_idle_returns_when_tasks_finish() {
        let tasks = BackgroundTasks::new();
        tasks.wait_idle().await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(tasks.active(), 1);

        let waiter = {
            let tasks = tasks.clone();
            tokio::spawn(async move { tasks.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tx.send(()).unwrap();
        waiter.await.unwrap();
        assert_eq!(tasks.active(), 0);
    }

    #[tokio::test]
    async fn aborted_tasks_are_released() {
        let tasks = BackgroundTasks::new();
        let handle = tasks.spawn(std::future::pending::<()>());
        handle.abort();
        let _ = handle.await;
        tasks.wait_idle().await;
        assert_eq!(tasks.active(), 0);
    }
}
