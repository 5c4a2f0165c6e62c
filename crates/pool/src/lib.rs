#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Nebula Pool
//!
//! Bounded, concurrency-safe access to an expensive shared session (a
//! database connection) for short units of work.
//!
//! This crate provides:
//! - [`Registry`] -- named, case-insensitive, create-once pools
//! - [`Pool`] -- `worker_count` sessions behind a bounded dispatcher, with a
//!   per-call deadline
//! - [`Dispatcher`] -- fixed worker group draining a bounded FIFO queue
//! - [`Session`] / [`Connector`] -- the seam to the backing resource
//!
//! A pooled call never uses more sessions concurrently than the pool has
//! workers, never waits longer than the call timeout, and always returns
//! the session it checked out, including when the work fails or panics.

pub mod config;
pub mod dispatcher;
pub mod error;
mod handles;
pub mod pool;
pub mod registry;
pub mod session;

#[cfg(feature = "testing")]
pub mod testing;

pub use config::{ConnectOptions, MAX_TIMEOUT, MIN_TIMEOUT};
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use error::{BoxError, Error, Result};
pub use pool::{Pool, PoolStats};
pub use registry::Registry;
pub use session::{Connector, Session};
