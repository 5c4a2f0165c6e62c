//! Session handle and connector traits
//!
//! The pool never speaks the backing resource's protocol. It dials once
//! through a [`Connector`], duplicates the resulting [`Session`] once per
//! worker, and hands scoped views of a checked-out session to caller work.

use async_trait::async_trait;

use crate::config::ConnectOptions;
use crate::error::BoxError;

/// A live session with the backing resource.
///
/// Views (`Database`, `Collection`) borrow the session's connection state and
/// must fail once the session is closed instead of blocking.
#[async_trait]
pub trait Session: Send + Sync + Sized + 'static {
    /// Namespace-scoped view handed to database-wide work.
    type Database: Send + 'static;

    /// Collection-scoped view handed to per-collection work.
    type Collection: Send + 'static;

    /// Produce an independent session sharing the same dial.
    fn duplicate(&self) -> Self;

    /// View of the given database.
    fn database(&self, name: &str) -> Self::Database;

    /// View of one collection inside the given database.
    fn collection(&self, database: &str, name: &str) -> Self::Collection;

    /// Release the session. Called exactly once per session by the pool.
    async fn close(self) -> Result<(), BoxError>;
}

/// Dials the backing resource.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by a successful dial.
    type Session: Session;

    /// Perform one dial with the given options.
    async fn connect(&self, options: &ConnectOptions) -> Result<Self::Session, BoxError>;
}
