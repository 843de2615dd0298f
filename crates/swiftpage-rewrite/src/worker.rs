//! Fixed-size thread pools for transformer work.
//!
//! Transformers are CPU-bound and synchronous, so they run on dedicated
//! threads rather than on the async runtime. A pool may bound its queue:
//! when a job arrives at a full queue, the oldest queued job is dropped
//! and its submitter sees [`RewriteErrorKind::LoadShed`].

use crate::error::{Result, RewriteError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use swiftpage_core::RewriteErrorKind;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Jobs accepted.
    pub submitted: u64,
    /// Jobs that ran to completion.
    pub completed: u64,
    /// Jobs dropped from a full queue.
    pub shed: u64,
    /// Jobs currently queued.
    pub queued: usize,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    name: String,
    queue: Mutex<Queue>,
    available: Condvar,
    queue_limit: Option<usize>,
    submitted: AtomicU64,
    completed: AtomicU64,
    shed: AtomicU64,
}

/// A pool of worker threads with a FIFO queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Starts `threads` workers. With a `queue_limit`, at most that many
    /// jobs wait; older ones are shed first.
    pub fn new(name: &str, threads: usize, queue_limit: Option<usize>) -> Result<Self> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
            queue_limit,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            shed: AtomicU64::new(0),
        });
        for n in 0..threads.max(1) {
            let worker = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || work(&worker))?;
        }
        tracing::debug!(pool = name, threads, ?queue_limit, "worker pool started");
        Ok(Self { shared })
    }

    /// Queues `job`. The receiver yields its result, or an error if the
    /// job was shed or panicked.
    pub fn submit<T, F>(&self, job: F) -> Result<oneshot::Receiver<std::result::Result<T, RewriteErrorKind>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let wrapped: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(job)).map_err(|_| {
                tracing::error!(pool = %shared.name, "worker job panicked");
                RewriteErrorKind::TransformerErrored
            });
            shared.completed.fetch_add(1, Ordering::Relaxed);
            // The submitter may have stopped waiting.
            let _ = tx.send(result);
        });

        let shed = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(RewriteError::PoolShutDown);
            }
            let shed = match self.shared.queue_limit {
                Some(limit) if queue.jobs.len() >= limit => queue.jobs.pop_front(),
                _ => None,
            };
            queue.jobs.push_back(wrapped);
            shed
        };
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        if shed.is_some() {
            self.shared.shed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(pool = %self.shared.name, kind = %RewriteErrorKind::LoadShed, "queue full, dropping oldest job");
        }
        drop(shed);
        self.shared.available.notify_one();
        Ok(rx)
    }

    /// Runs `job` on the pool and waits for its result.
    pub async fn run<T, F>(&self, job: F) -> std::result::Result<T, RewriteErrorKind>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let rx = self.submit(job).map_err(|_| RewriteErrorKind::LoadShed)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RewriteErrorKind::LoadShed),
        }
    }

    /// Returns current statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            shed: self.shared.shed.load(Ordering::Relaxed),
            queued: self.shared.queue.lock().jobs.len(),
        }
    }

    /// Stops accepting jobs. Queued jobs still run; workers exit once the
    /// queue is empty.
    pub fn shutdown(&self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        job();
    }
}
