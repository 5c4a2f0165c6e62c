//! Bounded dispatcher: a fixed worker group draining one bounded FIFO queue.
//!
//! `submit` waits while the queue is full, which is how back-pressure
//! reaches callers. Workers run at most `worker_count` tasks at once. A
//! task's top-level error is not returned to anyone; it is forwarded to an
//! error sink that logs it. Per-call outcomes travel on the caller's own
//! channel and never through here.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_channel::{Receiver, Sender};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::validate_sizes;
use crate::error::{Error, Result};

/// A unit of work accepted by the dispatcher.
pub type Task = BoxFuture<'static, Result<()>>;

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Tasks accepted into the queue.
    pub submitted: u64,
    /// Tasks currently executing.
    pub running: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Tasks that finished, successfully or not.
    pub completed: u64,
    /// Tasks whose top-level result was an error or a panic.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    running: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// A failed task as seen by the error sink.
struct TaskFailure {
    worker: usize,
    error: Error,
}

/// Fixed-size worker group over a bounded queue.
pub struct Dispatcher {
    name: String,
    worker_count: usize,
    queue_capacity: usize,
    tx: Sender<Task>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("worker_count", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Dispatcher {
    /// Start `worker_count` workers over a queue of `queue_capacity` slots.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Result<Self> {
        validate_sizes(worker_count, queue_capacity)?;
        let name = name.into();
        let (tx, rx) = async_channel::bounded(queue_capacity);
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        tokio::spawn(drain_failures(name.clone(), sink_rx));
        for worker in 0..worker_count {
            tokio::spawn(run_worker(
                name.clone(),
                worker,
                rx.clone(),
                sink_tx.clone(),
                Arc::clone(&counters),
            ));
        }

        tracing::debug!(dispatcher = %name, worker_count, queue_capacity, "dispatcher started");

        Ok(Self {
            name,
            worker_count,
            queue_capacity,
            tx,
            counters,
        })
    }

    /// Enqueue a task, waiting while the queue is full.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tx
            .send(Box::pin(task))
            .await
            .map_err(|_| Error::Closed {
                pool: self.name.clone(),
            })?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting tasks. Already queued tasks still run, then the
    /// workers exit.
    pub fn shutdown(&self) {
        if self.tx.close() {
            tracing::debug!(
                dispatcher = %self.name,
                queued = self.tx.len(),
                "dispatcher shutting down"
            );
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.tx.is_closed()
    }

    /// Number of workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue capacity.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            running: self.counters.running.load(Ordering::Relaxed),
            queued: self.tx.len(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    name: String,
    worker: usize,
    rx: Receiver<Task>,
    sink: mpsc::UnboundedSender<TaskFailure>,
    counters: Arc<Counters>,
) {
    while let Ok(task) = rx.recv().await {
        counters.running.fetch_add(1, Ordering::Relaxed);
        let outcome = AssertUnwindSafe(task).catch_unwind().await;
        counters.running.fetch_sub(1, Ordering::Relaxed);
        counters.completed.fetch_add(1, Ordering::Relaxed);

        let error = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => error,
            Err(payload) => Error::Panicked {
                pool: name.clone(),
                message: panic_message(payload.as_ref()),
            },
        };
        counters.failed.fetch_add(1, Ordering::Relaxed);
        let _ = sink.send(TaskFailure { worker, error });
    }
    tracing::debug!(dispatcher = %name, worker, "worker stopped");
}

async fn drain_failures(name: String, mut rx: mpsc::UnboundedReceiver<TaskFailure>) {
    while let Some(failure) = rx.recv().await {
        tracing::warn!(
            dispatcher = %name,
            worker = failure.worker,
            error = %failure.error,
            "task failed"
        );
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
