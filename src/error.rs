use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the shared store.
///
/// Precondition failures are not errors; they come back as
/// [`WriteOutcome::PreconditionFailed`](crate::store::WriteOutcome).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store worker has shut down")]
    Closed,
}

/// Rejected lock configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("lock name must not be empty")]
    EmptyName,

    #[error("concurrency limit must be at least 1")]
    ZeroLimit,

    #[error("retry interval must be greater than zero")]
    ZeroRetryInterval,

    #[error("no object store configured")]
    MissingStore,
}

/// Why a single acquisition attempt did not take the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    /// The shared counter was already at the limit.
    AtCapacity { active: u64, limit: u64 },
    /// The marker exists, or another process won the counter update.
    Contended,
    /// The store failed; retried like contention.
    Transient(String),
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::AtCapacity { active, limit } => {
                write!(f, "at capacity ({active}/{limit} active)")
            }
            Blocker::Contended => f.write_str("contended"),
            Blocker::Transient(e) => write!(f, "transient store error: {e}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("failed to acquire lock '{name}' after waiting {waited:?} ({attempts} attempts, last: {})",
        .last.as_ref().map(|b| b.to_string()).unwrap_or_else(|| "none".to_string()))]
    Timeout {
        name: String,
        waited: Duration,
        attempts: u32,
        last: Option<Blocker>,
    },

    #[error("lock '{0}' is already held by this handle")]
    AlreadyHeld(String),
}
