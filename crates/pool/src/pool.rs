//! Session pool: a fixed set of sessions behind a bounded dispatcher.
//!
//! Every call builds a task that checks out a session, runs the caller's
//! work against a scoped view, reports the outcome on a oneshot channel and
//! returns the session. The caller waits on that channel for at most the
//! pool's call timeout, which covers queueing as well as execution. A call
//! that times out is abandoned, not cancelled: its task still runs and still
//! returns its session.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;

use crate::config::{ConnectOptions, validate_sizes};
use crate::dispatcher::{Dispatcher, DispatcherStats, panic_message};
use crate::error::{BoxError, Error, Result};
use crate::handles::Freelist;
use crate::session::{Connector, Session};

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of sessions owned by the pool.
    pub size: usize,
    /// Sessions currently idle in the freelist.
    pub idle: usize,
    /// Total session checkouts.
    pub checkouts: u64,
    /// Total session returns.
    pub returns: u64,
    /// Sessions closed so far (at most `size` after teardown).
    pub closed_handles: u64,
    /// Calls whose work returned `Ok`.
    pub succeeded: u64,
    /// Calls whose work returned an error or panicked.
    pub failed: u64,
    /// Calls abandoned at the call timeout.
    pub timed_out: u64,
    /// Dispatcher counters.
    pub dispatcher: DispatcherStats,
}

#[derive(Default)]
struct CallCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// A named pool of `worker_count` sessions bound to one database.
pub struct Pool<S: Session> {
    name: String,
    database: String,
    call_timeout: Duration,
    freelist: Arc<Freelist<S>>,
    dispatcher: Dispatcher,
    calls: Arc<CallCounters>,
    closed: AtomicBool,
}

impl<S: Session> std::fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("database", &self.database)
            .field("call_timeout", &self.call_timeout)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<S: Session> Pool<S> {
    /// Dial once through `connector`, duplicate the session `worker_count`
    /// times and start a dispatcher sized `(worker_count, queue_capacity)`.
    ///
    /// The dial itself is bounded by `options.timeout`.
    pub async fn connect<C>(
        name: impl Into<String>,
        connector: &C,
        options: &ConnectOptions,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Result<Self>
    where
        C: Connector<Session = S>,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::EmptyName);
        }
        validate_sizes(worker_count, queue_capacity)?;
        options.validate()?;

        let root = match tokio::time::timeout(options.timeout, connector.connect(options)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(Error::connect(name, e)),
            Err(_) => {
                return Err(Error::Connect {
                    pool: name,
                    reason: format!("no reachable servers within {:?}", options.timeout),
                    source: None,
                });
            }
        };
        let sessions: Vec<S> = (0..worker_count).map(|_| root.duplicate()).collect();
        if let Err(e) = root.close().await {
            tracing::warn!(pool = %name, error = %e, "failed to close dial session");
        }

        let dispatcher = Dispatcher::new(name.clone(), worker_count, queue_capacity)?;

        tracing::info!(
            pool = %name,
            database = %options.database,
            worker_count,
            queue_capacity,
            timeout_ms = options.timeout.as_millis() as u64,
            "pool connected"
        );

        Ok(Self {
            freelist: Freelist::new(name.clone(), sessions),
            name,
            database: options.database.clone(),
            call_timeout: options.timeout,
            dispatcher,
            calls: Arc::new(CallCounters::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Run `work` against one collection of the pool's database.
    pub async fn execute_with_collection<T, E, F, Fut>(
        &self,
        collection: &str,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(S::Collection) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let database = self.database.clone();
        let collection = collection.to_owned();
        self.call(move |session: &S| session.collection(&database, &collection), work)
            .await
    }

    /// Run `work` against the whole database.
    ///
    /// Prefer [`execute_with_collection`](Self::execute_with_collection):
    /// this variant gives the work unrestricted access to the session's
    /// namespace and exists for operations spanning collections.
    pub async fn execute_with_database<T, E, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce(S::Database) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let database = self.database.clone();
        self.call(move |session: &S| session.database(&database), work)
            .await
    }

    async fn call<V, T, E, Sc, F, Fut>(&self, scope: Sc, work: F) -> Result<T>
    where
        Sc: FnOnce(&S) -> V + Send + 'static,
        F: FnOnce(V) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        V: Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let (tx, rx) = oneshot::channel::<Result<T>>();
        let task = run_task(
            self.name.clone(),
            Arc::clone(&self.freelist),
            Arc::clone(&self.calls),
            scope,
            work,
            tx,
        );

        let envelope = async {
            self.dispatcher.submit(task).await?;
            rx.await.unwrap_or_else(|_| Err(self.closed_error()))
        };

        match tokio::time::timeout(self.call_timeout, envelope).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.calls.timed_out.fetch_add(1, Ordering::Relaxed);
                let timeout_ms = self.call_timeout.as_millis() as u64;
                tracing::warn!(pool = %self.name, timeout_ms, "call timed out");
                Err(Error::OperationTimeout {
                    pool: self.name.clone(),
                    timeout_ms,
                })
            }
        }
    }

    /// Tear the pool down.
    ///
    /// Idle sessions are closed now; sessions held by running tasks are
    /// closed when those tasks return them. Tasks still waiting for a session
    /// fail with [`Error::Closed`], as do new calls. Calling this twice is a
    /// no-op.
    ///
    /// The idle sessions are drained on a spawned task, so dropping this
    /// future part way still closes every one of them. Teardown needs a live
    /// Tokio runtime: a pool dropped without `close` leaves its idle sessions
    /// unclosed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatcher.shutdown();

        let freelist = Arc::clone(&self.freelist);
        match tokio::spawn(async move { freelist.close().await }).await {
            Ok(closed) => tracing::info!(
                pool = %self.name,
                closed,
                in_flight = self.freelist.size() - closed,
                "pool closed"
            ),
            Err(e) => tracing::error!(pool = %self.name, error = %e, "session drain failed"),
        }
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.freelist.is_closed()
    }

    /// Normalised pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database the sessions are bound to.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Deadline applied to every call.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Number of workers, which is also the number of sessions.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.dispatcher.worker_count()
    }

    /// Dispatcher queue capacity.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.dispatcher.queue_capacity()
    }

    /// Sessions currently idle.
    #[must_use]
    pub fn idle_handles(&self) -> usize {
        self.freelist.idle()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.freelist.size(),
            idle: self.freelist.idle(),
            checkouts: self.freelist.checkouts(),
            returns: self.freelist.returns(),
            closed_handles: self.freelist.closed_handles(),
            succeeded: self.calls.succeeded.load(Ordering::Relaxed),
            failed: self.calls.failed.load(Ordering::Relaxed),
            timed_out: self.calls.timed_out.load(Ordering::Relaxed),
            dispatcher: self.dispatcher.stats(),
        }
    }

    fn closed_error(&self) -> Error {
        Error::Closed {
            pool: self.name.clone(),
        }
    }
}

/// Checkout, invoke, report, return.
///
/// The session guard outlives the work future, so the return happens after
/// the report on every path, including a panic while building the view or
/// running the work.
async fn run_task<S, V, T, E, Sc, F, Fut>(
    pool: String,
    freelist: Arc<Freelist<S>>,
    calls: Arc<CallCounters>,
    scope: Sc,
    work: F,
    report: oneshot::Sender<Result<T>>,
) -> Result<()>
where
    S: Session,
    Sc: FnOnce(&S) -> V + Send + 'static,
    F: FnOnce(V) -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    V: Send + 'static,
    T: Send + 'static,
    E: Into<BoxError> + 'static,
{
    let session = match freelist.checkout().await {
        Ok(session) => session,
        Err(e) => {
            let _ = report.send(Err(Error::Closed { pool: pool.clone() }));
            return Err(e);
        }
    };

    let outcome = AssertUnwindSafe(async {
        let view = scope(&*session);
        work(view).await
    })
    .catch_unwind()
    .await;

    let (result, task_error) = match outcome {
        Ok(Ok(value)) => {
            calls.succeeded.fetch_add(1, Ordering::Relaxed);
            (Ok(value), None)
        }
        Ok(Err(e)) => {
            calls.failed.fetch_add(1, Ordering::Relaxed);
            (Err(Error::work(e)), None)
        }
        Err(payload) => {
            calls.failed.fetch_add(1, Ordering::Relaxed);
            let message = panic_message(payload.as_ref());
            (
                Err(Error::Panicked {
                    pool: pool.clone(),
                    message: message.clone(),
                }),
                Some(Error::Panicked { pool: pool.clone(), message }),
            )
        }
    };

    if report.send(result).is_err() {
        tracing::debug!(pool = %pool, "caller gone, outcome discarded");
    }
    drop(session);

    task_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryConnector, MemoryError};

    fn options(timeout: Duration) -> ConnectOptions {
        ConnectOptions::new("mem:27017", "test").with_timeout(timeout)
    }

    #[tokio::test]
    async fn connect_dials_once_and_duplicates_per_worker() {
        let connector = MemoryConnector::new();
        let pool = Pool::connect("items", &connector, &options(Duration::from_secs(1)), 3, 5)
            .await
            .unwrap();

        let stats = connector.stats();
        assert_eq!(stats.dials, 1);
        assert_eq!(stats.duplicates, 3);
        assert_eq!(pool.idle_handles(), 3);
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.queue_capacity(), 5);
        assert_eq!(pool.database(), "test");
        assert_eq!(pool.call_timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn collection_call_returns_value() {
        let connector = MemoryConnector::new();
        let pool = Pool::connect("items", &connector, &options(Duration::from_secs(1)), 1, 1)
            .await
            .unwrap();

        pool.execute_with_collection("posts", |c| async move {
            c.insert(serde_json::json!({"_id": 1, "link": "a"}))
        })
        .await
        .unwrap();

        let count = pool
            .execute_with_collection("posts", |c| async move { c.count() })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn work_error_is_passed_through() {
        let connector = MemoryConnector::new();
        let pool = Pool::connect("items", &connector, &options(Duration::from_secs(1)), 1, 1)
            .await
            .unwrap();

        let doc = serde_json::json!({"_id": 7});
        let first = doc.clone();
        pool.execute_with_collection("posts", move |c| async move { c.insert(first) })
            .await
            .unwrap();
        let err = pool
            .execute_with_collection("posts", move |c| async move { c.insert(doc) })
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_work::<MemoryError>(),
            Some(MemoryError::DuplicateKey { .. })
        ));
        assert_eq!(pool.idle_handles(), 1);
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn database_call_sees_all_collections() {
        let connector = MemoryConnector::new();
        let pool = Pool::connect("items", &connector, &options(Duration::from_secs(1)), 2, 2)
            .await
            .unwrap();

        for name in ["a", "b"] {
            pool.execute_with_collection(name, |c| async move { c.insert(serde_json::json!({})) })
                .await
                .unwrap();
        }
        let names = pool
            .execute_with_database(|db| async move { Ok::<_, MemoryError>(db.collection_names()) })
            .await
            .unwrap();
        assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_calls() {
        let connector = MemoryConnector::new();
        let pool = Pool::connect("items", &connector, &options(Duration::from_secs(1)), 2, 2)
            .await
            .unwrap();

        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(connector.stats().closes, 3, "dial session plus two duplicates");

        let err = pool
            .execute_with_collection("posts", |c| async move { c.count() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed { .. }));
    }
}
