//! Session freelist and the RAII checkout guard
//!
//! The freelist is a bounded channel holding exactly `worker_count`
//! sessions: checkout receives, return sends. A session is therefore used by
//! at most one task at a time, and it is closed exactly once: either by
//! [`Freelist::close`] while idle, or by its guard when it comes back after
//! teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_channel::{Receiver, Sender, TrySendError};

use crate::error::{Error, Result};
use crate::session::Session;

pub(crate) struct Freelist<S: Session> {
    pool: String,
    size: usize,
    tx: Sender<S>,
    rx: Receiver<S>,
    checkouts: AtomicU64,
    returns: AtomicU64,
    closed_handles: AtomicU64,
}

impl<S: Session> Freelist<S> {
    /// Build a freelist holding every session in `sessions`.
    pub(crate) fn new(pool: impl Into<String>, sessions: Vec<S>) -> Arc<Self> {
        let size = sessions.len();
        let (tx, rx) = async_channel::bounded(size.max(1));
        for session in sessions {
            // Capacity equals the number of sessions, so this cannot fill up.
            let _ = tx.try_send(session);
        }
        Arc::new(Self {
            pool: pool.into(),
            size,
            tx,
            rx,
            checkouts: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            closed_handles: AtomicU64::new(0),
        })
    }

    /// Wait for a free session.
    ///
    /// Fails with [`Error::Closed`] once the freelist is torn down, including
    /// for a task that wins a session racing teardown.
    pub(crate) async fn checkout(self: &Arc<Self>) -> Result<Checkout<S>> {
        let session = self.rx.recv().await.map_err(|_| self.closed_error())?;
        self.checkouts.fetch_add(1, Ordering::Relaxed);
        let checkout = Checkout {
            session: Some(session),
            freelist: Arc::clone(self),
        };
        if self.tx.is_closed() {
            // Dropping the guard closes the session.
            drop(checkout);
            return Err(self.closed_error());
        }
        Ok(checkout)
    }

    fn give_back(&self, session: S) {
        self.returns.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(session) {
            Ok(()) => {}
            Err(TrySendError::Closed(session)) => self.close_detached(session),
            Err(TrySendError::Full(session)) => {
                tracing::error!(
                    pool = %self.pool,
                    "freelist over capacity, closing surplus session"
                );
                self.close_detached(session);
            }
        }
    }

    /// Close a session from a synchronous context.
    ///
    /// Needs a live Tokio runtime; without one the session is dropped
    /// unclosed and is not counted in `closed_handles`.
    fn close_detached(&self, session: S) {
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.closed_handles.fetch_add(1, Ordering::Relaxed);
                drop(handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        tracing::warn!(
                            pool = %pool,
                            error = %e,
                            "failed to close returned session"
                        );
                    }
                }));
            }
            Err(_) => {
                tracing::warn!(pool = %pool, "no runtime to close returned session, dropping it");
                drop(session);
            }
        }
    }

    /// Close the freelist and every session currently idle in it.
    ///
    /// Returns how many sessions were closed here; checked-out sessions are
    /// closed by their guards on return.
    pub(crate) async fn close(&self) -> usize {
        self.tx.close();
        let mut closed = 0;
        while let Ok(session) = self.rx.try_recv() {
            self.closed_handles.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = session.close().await {
                tracing::warn!(pool = %self.pool, error = %e, "failed to close idle session");
            }
            closed += 1;
        }
        closed
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn idle(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn checkouts(&self) -> u64 {
        self.checkouts.load(Ordering::Relaxed)
    }

    pub(crate) fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    pub(crate) fn closed_handles(&self) -> u64 {
        self.closed_handles.load(Ordering::Relaxed)
    }

    fn closed_error(&self) -> Error {
        Error::Closed {
            pool: self.pool.clone(),
        }
    }
}

/// A checked-out session. Dropping it returns the session to its freelist,
/// on every path including unwinding.
pub(crate) struct Checkout<S: Session> {
    session: Option<S>,
    freelist: Arc<Freelist<S>>,
}

impl<S: Session> std::ops::Deref for Checkout<S> {
    type Target = S;

    fn deref(&self) -> &S {
        // Only `Drop` takes the session out.
        self.session.as_ref().expect("checkout used after return")
    }
}

impl<S: Session> Drop for Checkout<S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.freelist.give_back(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectOptions;
    use crate::session::Connector;
    use crate::testing::{MemoryConnector, MemorySession};

    async fn freelist(size: usize) -> (MemoryConnector, Arc<Freelist<MemorySession>>) {
        let connector = MemoryConnector::new();
        let root = connector
            .connect(&ConnectOptions::new("mem:1", "test"))
            .await
            .unwrap();
        let sessions = (0..size).map(|_| root.duplicate()).collect();
        (connector, Freelist::new("test", sessions))
    }

    #[tokio::test]
    async fn checkout_and_return_restore_idle_count() {
        let (_connector, list) = freelist(2).await;
        assert_eq!(list.idle(), 2);

        let a = list.checkout().await.unwrap();
        let b = list.checkout().await.unwrap();
        assert_eq!(list.idle(), 0);

        drop(a);
        drop(b);
        assert_eq!(list.idle(), 2);
        assert_eq!(list.checkouts(), 2);
        assert_eq!(list.returns(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn checkout_waits_for_a_free_session() {
        let (_connector, list) = freelist(1).await;
        let held = list.checkout().await.unwrap();

        let waiting =
            tokio::time::timeout(std::time::Duration::from_millis(50), list.checkout()).await;
        assert!(waiting.is_err(), "second checkout must wait");

        drop(held);
        assert!(list.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn close_then_return_closes_each_session_once() {
        let (connector, list) = freelist(3).await;
        let held = list.checkout().await.unwrap();

        assert_eq!(list.close().await, 2);
        assert!(list.checkout().await.is_err());

        drop(held);
        // The returned session is closed on a spawned task.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(list.closed_handles(), 3);
        assert_eq!(connector.stats().closes, 3);
    }

    #[test]
    fn return_without_runtime_is_not_counted_as_closed() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (connector, list, held) = runtime.block_on(async {
            let (connector, list) = freelist(2).await;
            let held = list.checkout().await.unwrap();
            assert_eq!(list.close().await, 1);
            (connector, list, held)
        });
        drop(runtime);

        drop(held);
        assert_eq!(list.returns(), 1);
        assert_eq!(list.closed_handles(), 1);
        assert_eq!(connector.stats().closes, 1);
    }
}
