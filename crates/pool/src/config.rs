//! Connect options and size validation

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest accepted connect/call timeout (inclusive).
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest accepted connect/call timeout (inclusive).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(10);

/// Options used to dial the backing resource once per pool.
///
/// `timeout` doubles as the pool's call timeout: every pooled call waits at
/// most this long for admission plus execution.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Target addresses, `host:port`.
    pub addrs: Vec<String>,
    /// Logical database (namespace) the sessions are bound to.
    pub database: String,
    /// Optional user name.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,
    /// Connect and call timeout.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    MIN_TIMEOUT
}

impl ConnectOptions {
    /// Options for a single address and database with the default timeout.
    pub fn new(addr: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            addrs: vec![addr.into()],
            database: database.into(),
            username: None,
            password: None,
            timeout: default_timeout(),
        }
    }

    /// Add another target address.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addrs.push(addr.into());
        self
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the connect/call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check the timeout window.
    ///
    /// Addresses and database are left to the connector, which knows what a
    /// usable target looks like.
    pub fn validate(&self) -> Result<()> {
        validate_timeout(self.timeout)
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("addrs", &self.addrs)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Reject timeouts outside `[MIN_TIMEOUT, MAX_TIMEOUT]`.
pub fn validate_timeout(timeout: Duration) -> Result<()> {
    if (MIN_TIMEOUT..=MAX_TIMEOUT).contains(&timeout) {
        Ok(())
    } else {
        Err(Error::InvalidTimeout {
            timeout,
            min: MIN_TIMEOUT,
            max: MAX_TIMEOUT,
        })
    }
}

/// Reject a worker count or queue capacity below one.
pub(crate) fn validate_sizes(worker_count: usize, queue_capacity: usize) -> Result<()> {
    if worker_count < 1 {
        return Err(Error::InvalidWorkerCount {
            count: worker_count,
        });
    }
    if queue_capacity < 1 {
        return Err(Error::InvalidQueueCapacity {
            capacity: queue_capacity,
        });
    }
    Ok(())
}
