//! Registry of named pools.
//!
//! The registry is an ordinary value owned by the application entry point
//! and shared by reference; there is no process-global state. Names are
//! case-insensitive: `"Mongo"` and `"mongo"` are the same pool.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::config::{ConnectOptions, validate_sizes};
use crate::error::{BoxError, Error, Result};
use crate::pool::Pool;
use crate::session::{Connector, Session};

enum Slot<S: Session> {
    /// Name reserved while the dial is in progress.
    Initializing,
    Ready(Arc<Pool<S>>),
}

/// Thread-safe, create-once registry of session pools.
///
/// # Examples
///
/// ```rust,ignore
/// let registry = Registry::new(connector);
/// registry.create("mongo", Some(options), 3, 10).await?;
/// let n = registry
///     .execute_with_collection("mongo", "items", |c| async move { c.count() })
///     .await?;
/// registry.close("mongo").await?;
/// ```
pub struct Registry<C: Connector> {
    connector: C,
    pools: DashMap<String, Slot<C::Session>>,
}

impl<C: Connector> Registry<C> {
    /// Create an empty registry dialling through `connector`.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            pools: DashMap::new(),
        }
    }

    /// The connector used for every dial.
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Create and register a pool.
    ///
    /// Validation runs before anything else, in this order: name, options,
    /// worker count, queue capacity, timeout. The name is then reserved, so
    /// concurrent creates under one name produce a single success; the
    /// reservation is released if the dial fails.
    pub async fn create(
        &self,
        name: &str,
        options: Option<ConnectOptions>,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Result<Arc<Pool<C::Session>>> {
        let key = normalize(name)?;
        let options = options.ok_or(Error::EmptyOptions)?;
        validate_sizes(worker_count, queue_capacity)?;
        options.validate()?;

        let reservation = self.reserve(&key)?;
        let pool = Pool::connect(
            key.clone(),
            &self.connector,
            &options,
            worker_count,
            queue_capacity,
        )
        .await
        .inspect_err(|e| tracing::warn!(pool = %key, error = %e, "pool creation failed"))?;

        let pool = Arc::new(pool);
        reservation.commit(Arc::clone(&pool));
        Ok(pool)
    }

    /// Look up a ready pool.
    pub fn get(&self, name: &str) -> Result<Arc<Pool<C::Session>>> {
        let key = name.to_lowercase();
        match self.pools.get(&key).as_deref() {
            Some(Slot::Ready(pool)) => Ok(Arc::clone(pool)),
            Some(Slot::Initializing) | None => Err(Error::NotFound { name: key }),
        }
    }

    /// Whether a ready pool exists under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    /// Run collection-scoped work on the named pool.
    ///
    /// An unknown name fails with [`Error::NotFound`] without calling `work`.
    pub async fn execute_with_collection<T, E, F, Fut>(
        &self,
        name: &str,
        collection: &str,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(<C::Session as Session>::Collection) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let pool = self.get(name)?;
        pool.execute_with_collection(collection, work).await
    }

    /// Run database-wide work on the named pool.
    pub async fn execute_with_database<T, E, F, Fut>(&self, name: &str, work: F) -> Result<T>
    where
        F: FnOnce(<C::Session as Session>::Database) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let pool = self.get(name)?;
        pool.execute_with_database(work).await
    }

    /// Remove the named pool and tear it down.
    ///
    /// The name becomes available to [`create`](Self::create) again as soon
    /// as this returns.
    pub async fn close(&self, name: &str) -> Result<()> {
        let key = name.to_lowercase();
        let removed = self
            .pools
            .remove_if(&key, |_, slot| matches!(slot, Slot::Ready(_)));
        match removed {
            Some((_, Slot::Ready(pool))) => {
                pool.close().await;
                Ok(())
            }
            _ => Err(Error::NotFound { name: key }),
        }
    }

    /// Close every ready pool.
    pub async fn shutdown(&self) {
        for name in self.names() {
            // A concurrent close may have won; either way it is gone.
            let _ = self.close(&name).await;
        }
    }

    /// Names of ready pools, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pools
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Number of ready pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .count()
    }

    /// Whether no pool is ready.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reserve(&self, key: &str) -> Result<Reservation<'_, C::Session>> {
        match self.pools.entry(key.to_owned()) {
            Entry::Occupied(_) => Err(Error::AlreadyInitialized {
                name: key.to_owned(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Initializing);
                Ok(Reservation {
                    pools: &self.pools,
                    key: key.to_owned(),
                    committed: false,
                })
            }
        }
    }
}

impl<C: Connector> std::fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("pools", &self.names())
            .finish()
    }
}

/// A reserved name. Dropped without [`commit`](Self::commit), it frees the
/// name again, which covers both a failed dial and a cancelled `create`.
struct Reservation<'a, S: Session> {
    pools: &'a DashMap<String, Slot<S>>,
    key: String,
    committed: bool,
}

impl<S: Session> Reservation<'_, S> {
    fn commit(mut self, pool: Arc<Pool<S>>) {
        self.pools.insert(self.key.clone(), Slot::Ready(pool));
        self.committed = true;
    }
}

impl<S: Session> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if !self.committed {
            self.pools
                .remove_if(&self.key, |_, slot| matches!(slot, Slot::Initializing));
        }
    }
}

fn normalize(name: &str) -> Result<String> {
    if name.trim().is_empty() {
        return Err(Error::EmptyName);
    }
    Ok(name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryConnector;
    use std::time::Duration;

    fn opts() -> Option<ConnectOptions> {
        Some(ConnectOptions::new("mem:27017", "test").with_timeout(Duration::from_secs(1)))
    }

    #[test]
    fn normalize_lowercases() {
        assert_eq!(normalize("MONGO").unwrap(), "mongo");
        assert!(matches!(normalize("  "), Err(Error::EmptyName)));
    }

    #[tokio::test]
    async fn create_get_close_create_again() {
        let registry = Registry::new(MemoryConnector::new());
        registry.create("Mongo", opts(), 1, 1).await.unwrap();

        assert!(registry.contains("MONGO"));
        assert_eq!(registry.names(), vec!["mongo".to_owned()]);
        assert_eq!(registry.get("mongo").unwrap().name(), "mongo");

        registry.close("mongo").await.unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.close("mongo").await,
            Err(Error::NotFound { .. })
        ));

        registry.create("mongo", opts(), 1, 1).await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn failed_dial_releases_name() {
        let registry = Registry::new(MemoryConnector::new());
        let err = registry
            .create("x", Some(ConnectOptions { addrs: vec![], ..opts().unwrap() }), 1, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
        assert!(registry.pools.is_empty(), "reservation must be released");

        registry.create("x", opts(), 1, 1).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let registry = Registry::new(MemoryConnector::new());
        registry.create("a", opts(), 2, 1).await.unwrap();
        registry.create("b", opts(), 1, 1).await.unwrap();

        registry.shutdown().await;
        assert!(registry.is_empty());
        // Two dial sessions plus three duplicates.
        assert_eq!(registry.connector().stats().closes, 5);
    }
}
