//! Shared object store abstraction.
//!
//! The lock only needs three primitives from a store: read an object with its
//! version token, write an object under a precondition, and delete an object
//! (optionally only if its version still matches). Everything else, including
//! the concurrency counter, is built on top of these.

mod fs;
mod memory;
mod spanner;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use spanner::{DEFAULT_TABLE, SpannerStore};

use crate::error::StoreError;
use std::fmt;

/// Opaque version token returned by a store for every stored object.
///
/// Tokens are only ever compared for equality against what the same store
/// handed out; their format differs per backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Version(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored object: its body and the version token it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub body: Vec<u8>,
    pub version: Version,
}

/// Condition a write must satisfy to take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional write (create or overwrite).
    None,
    /// Create only; fail if the key already exists.
    IfAbsent,
    /// Overwrite only if the current version matches.
    IfMatch(Version),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(Version),
    PreconditionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Missing,
    PreconditionFailed,
}

/// Storage service shared by all lock participants.
///
/// Implementations must make `put` with [`Precondition::IfAbsent`] or
/// [`Precondition::IfMatch`] atomic with respect to other writers of the same
/// key; the lock's correctness rests on it.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Object>, StoreError>;

    fn put(&self, key: &str, body: Vec<u8>, cond: Precondition)
    -> Result<WriteOutcome, StoreError>;

    /// Deletes `key`. With `expected` set, the delete only happens if the
    /// stored version still matches.
    fn delete(&self, key: &str, expected: Option<&Version>) -> Result<DeleteOutcome, StoreError>;
}
