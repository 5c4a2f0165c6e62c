//! In-memory connector and session for tests and demos
//!
//! [`MemoryConnector`] dials a shared document store. Every session it
//! produces shares that store and reports dials, duplicates and closes, so
//! tests can check that every session is closed exactly once. Dials and
//! closes can be slowed down to exercise timeouts and cancelled teardown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::ConnectOptions;
use crate::error::BoxError;
use crate::session::{Connector, Session};

/// Errors raised by the in-memory store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// The session behind a view was closed.
    #[error("session closed")]
    SessionClosed,
    /// A document with the same `_id` already exists.
    #[error("duplicate key {id} in {collection}")]
    DuplicateKey {
        /// Collection name
        collection: String,
        /// The clashing `_id`
        id: String,
    },
    /// The dial was configured to fail.
    #[error("{0}")]
    Unreachable(String),
}

/// Lifecycle counters shared by a connector and all its sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Successful dials.
    pub dials: u64,
    /// Sessions produced by `duplicate`.
    pub duplicates: u64,
    /// Sessions closed.
    pub closes: u64,
}

#[derive(Default)]
struct Counters {
    dials: AtomicU64,
    duplicates: AtomicU64,
    closes: AtomicU64,
}

type Databases = BTreeMap<String, BTreeMap<String, Vec<Value>>>;

#[derive(Default)]
struct Store {
    databases: Mutex<Databases>,
}

/// Connector over a process-local document store.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    store: Arc<Store>,
    counters: Arc<Counters>,
    fail_with: Option<String>,
    latency: Option<Duration>,
    close_latency: Option<Duration>,
}

impl MemoryConnector {
    /// A connector whose dials always succeed immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every dial fail with `reason`.
    #[must_use]
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.fail_with = Some(reason.into());
        self
    }

    /// Delay every dial by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delay every session close by `latency`.
    #[must_use]
    pub fn with_close_latency(mut self, latency: Duration) -> Self {
        self.close_latency = Some(latency);
        self
    }

    /// Current lifecycle counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            dials: self.counters.dials.load(Ordering::SeqCst),
            duplicates: self.counters.duplicates.load(Ordering::SeqCst),
            closes: self.counters.closes.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self, options: &ConnectOptions) -> Result<MemorySession, BoxError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(reason) = &self.fail_with {
            return Err(Box::new(MemoryError::Unreachable(reason.clone())));
        }
        if options.addrs.is_empty() {
            return Err(Box::new(MemoryError::Unreachable("no addresses".into())));
        }
        self.counters.dials.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            store: Arc::clone(&self.store),
            counters: Arc::clone(&self.counters),
            closed: Arc::new(AtomicBool::new(false)),
            close_latency: self.close_latency,
        })
    }
}

/// One session over the shared store.
pub struct MemorySession {
    store: Arc<Store>,
    counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
    close_latency: Option<Duration>,
}

#[async_trait]
impl Session for MemorySession {
    type Database = MemoryDatabase;
    type Collection = MemoryCollection;

    fn duplicate(&self) -> Self {
        self.counters.duplicates.fetch_add(1, Ordering::SeqCst);
        Self {
            store: Arc::clone(&self.store),
            counters: Arc::clone(&self.counters),
            closed: Arc::new(AtomicBool::new(false)),
            close_latency: self.close_latency,
        }
    }

    fn database(&self, name: &str) -> MemoryDatabase {
        MemoryDatabase {
            store: Arc::clone(&self.store),
            closed: Arc::clone(&self.closed),
            name: name.to_owned(),
        }
    }

    fn collection(&self, database: &str, name: &str) -> MemoryCollection {
        self.database(database).collection(name)
    }

    async fn close(self) -> Result<(), BoxError> {
        if let Some(latency) = self.close_latency {
            tokio::time::sleep(latency).await;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Database view of a [`MemorySession`].
pub struct MemoryDatabase {
    store: Arc<Store>,
    closed: Arc<AtomicBool>,
    name: String,
}

impl MemoryDatabase {
    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// View of one collection.
    #[must_use]
    pub fn collection(&self, name: &str) -> MemoryCollection {
        MemoryCollection {
            store: Arc::clone(&self.store),
            closed: Arc::clone(&self.closed),
            database: self.name.clone(),
            name: name.to_owned(),
        }
    }

    /// Names of collections holding at least one document, sorted.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        self.store
            .databases
            .lock()
            .get(&self.name)
            .map(|cols| cols.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Collection view of a [`MemorySession`].
pub struct MemoryCollection {
    store: Arc<Store>,
    closed: Arc<AtomicBool>,
    database: String,
    name: String,
}

impl MemoryCollection {
    /// Collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a document. A string or numeric `_id` must be unique.
    pub fn insert(&self, doc: Value) -> Result<(), MemoryError> {
        self.ensure_open()?;
        let mut dbs = self.store.databases.lock();
        let docs = dbs
            .entry(self.database.clone())
            .or_default()
            .entry(self.name.clone())
            .or_default();
        if let Some(id) = doc.get("_id")
            && docs.iter().any(|d| d.get("_id") == Some(id))
        {
            return Err(MemoryError::DuplicateKey {
                collection: self.name.clone(),
                id: id.to_string(),
            });
        }
        docs.push(doc);
        Ok(())
    }

    /// Up to `limit` documents in insertion order.
    pub fn find(&self, limit: usize) -> Result<Vec<Value>, MemoryError> {
        self.ensure_open()?;
        Ok(self
            .store
            .databases
            .lock()
            .get(&self.database)
            .and_then(|cols| cols.get(&self.name))
            .map(|docs| docs.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    /// Number of documents.
    pub fn count(&self) -> Result<usize, MemoryError> {
        self.ensure_open()?;
        Ok(self
            .store
            .databases
            .lock()
            .get(&self.database)
            .and_then(|cols| cols.get(&self.name))
            .map_or(0, Vec::len))
    }

    fn ensure_open(&self) -> Result<(), MemoryError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MemoryError::SessionClosed)
        } else {
            Ok(())
        }
    }
}
