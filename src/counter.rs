//! Shared active-holder counter.
//!
//! A single `{"count": n}` object counts the holders across every lock name
//! that shares its key. It is only ever changed with compare-and-swap writes
//! keyed on the version observed by the preceding read, so concurrent
//! updates cannot silently overwrite each other.

use crate::error::StoreError;
use crate::store::{ObjectStore, Precondition, Version, WriteOutcome};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_COUNTER_KEY: &str = "active_locks.json";

/// Upper bound on read + CAS rounds for the best-effort helpers.
const MAX_CAS_ROUNDS: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct CountRecord {
    count: u64,
}

/// Count observed at a specific version of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountSnapshot {
    pub count: u64,
    /// `None` when the record does not exist yet.
    pub version: Option<Version>,
}

/// Result of a single compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cas {
    Updated(CountSnapshot),
    /// The record changed since the snapshot was taken.
    Conflict,
}

/// Result of [`Counter::try_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Reserved(CountSnapshot),
    AtCapacity(u64),
    Conflict,
}

#[derive(Clone)]
pub struct Counter {
    store: Arc<dyn ObjectStore>,
    key: String,
}

impl Counter {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Counter {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads the record. A body that does not parse counts as zero but keeps
    /// its version, so the next CAS overwrites it.
    pub fn read(&self) -> Result<CountSnapshot, StoreError> {
        let Some(obj) = self.store.get(&self.key)? else {
            return Ok(CountSnapshot {
                count: 0,
                version: None,
            });
        };

        let count = match serde_json::from_slice::<CountRecord>(&obj.body) {
            Ok(r) => r.count,
            Err(e) => {
                warn!("counter '{}' unreadable, treating as 0: {e}", self.key);
                0
            }
        };

        Ok(CountSnapshot {
            count,
            version: Some(obj.version),
        })
    }

    /// Current count; 0 when the record is missing, corrupt or unreachable.
    pub fn read_count(&self) -> u64 {
        match self.read() {
            Ok(s) => s.count,
            Err(e) => {
                warn!("read counter '{}' failed, treating as 0: {e}", self.key);
                0
            }
        }
    }

    pub fn try_increment(&self, seen: &CountSnapshot) -> Result<Cas, StoreError> {
        self.swap(seen, seen.count.saturating_add(1))
    }

    /// Decrements, floored at zero.
    pub fn try_decrement(&self, seen: &CountSnapshot) -> Result<Cas, StoreError> {
        self.swap(seen, seen.count.saturating_sub(1))
    }

    /// Capacity gate fused with the increment: takes a slot only if fewer
    /// than `limit` are in use at the version written against.
    pub fn try_reserve(&self, limit: u64) -> Result<Reservation, StoreError> {
        let seen = self.read()?;
        if seen.count >= limit {
            return Ok(Reservation::AtCapacity(seen.count));
        }

        Ok(match self.try_increment(&seen)? {
            Cas::Updated(s) => Reservation::Reserved(s),
            Cas::Conflict => Reservation::Conflict,
        })
    }

    /// Best-effort increment; returns the count written, if any.
    pub fn increment(&self) -> Option<u64> {
        self.update("increment", |s| self.try_increment(s))
    }

    /// Best-effort decrement; returns the count written, if any.
    pub fn decrement(&self) -> Option<u64> {
        self.update("decrement", |s| self.try_decrement(s))
    }

    /// Overwrites the record with zero regardless of its state.
    pub fn reset(&self) -> Result<(), StoreError> {
        let body = encode(0);
        self.store.put(&self.key, body, Precondition::None)?;
        info!("counter '{}' reset to 0", self.key);
        Ok(())
    }

    fn swap(&self, seen: &CountSnapshot, count: u64) -> Result<Cas, StoreError> {
        let cond = match &seen.version {
            Some(v) => Precondition::IfMatch(v.clone()),
            None => Precondition::IfAbsent,
        };

        Ok(match self.store.put(&self.key, encode(count), cond)? {
            WriteOutcome::Written(version) => Cas::Updated(CountSnapshot {
                count,
                version: Some(version),
            }),
            WriteOutcome::PreconditionFailed => Cas::Conflict,
        })
    }

    fn update<F>(&self, what: &str, op: F) -> Option<u64>
    where
        F: Fn(&CountSnapshot) -> Result<Cas, StoreError>,
    {
        for _ in 0..MAX_CAS_ROUNDS {
            let res = self.read().and_then(|seen| op(&seen));
            match res {
                Ok(Cas::Updated(s)) => return Some(s.count),
                Ok(Cas::Conflict) => continue,
                Err(e) => {
                    error!("counter '{}' {what} failed: {e}", self.key);
                    return None;
                }
            }
        }

        error!(
            "counter '{}' {what} gave up after {MAX_CAS_ROUNDS} conflicting writes",
            self.key
        );
        None
    }
}

fn encode(count: u64) -> Vec<u8> {
    serde_json::to_vec(&CountRecord { count })
        .unwrap_or_else(|_| format!(r#"{{"count":{count}}}"#).into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn counter() -> (Arc<MemoryStore>, Counter) {
        let store = Arc::new(MemoryStore::new());
        let c = Counter::new(store.clone(), DEFAULT_COUNTER_KEY);
        (store, c)
    }

    #[test]
    fn never_initialized_reads_zero() {
        let (store, c) = counter();
        assert_eq!(c.read_count(), 0);
        assert_eq!(c.read().unwrap().version, None);
        assert!(store.is_empty());
    }

    #[test]
    fn corrupted_reads_zero_and_heals() {
        let (store, c) = counter();
        store
            .put(DEFAULT_COUNTER_KEY, b"not json".to_vec(), Precondition::None)
            .unwrap();
        assert_eq!(c.read_count(), 0);

        assert_eq!(c.increment(), Some(1));
        let body = store.get(DEFAULT_COUNTER_KEY).unwrap().unwrap().body;
        assert_eq!(body, br#"{"count":1}"#.to_vec());
    }

    #[test]
    fn negative_count_is_corruption() {
        let (store, c) = counter();
        store
            .put(DEFAULT_COUNTER_KEY, br#"{"count":-3}"#.to_vec(), Precondition::None)
            .unwrap();
        assert_eq!(c.read_count(), 0);
    }

    #[test]
    fn stale_snapshot_conflicts() {
        let (_store, c) = counter();
        let seen = c.read().unwrap();
        assert!(matches!(c.try_increment(&seen).unwrap(), Cas::Updated(_)));

        // Same snapshot again: the record now exists, IfAbsent must fail.
        assert_eq!(c.try_increment(&seen).unwrap(), Cas::Conflict);
        assert_eq!(c.read_count(), 1);

        let now = c.read().unwrap();
        let Cas::Updated(after) = c.try_increment(&now).unwrap() else {
            panic!("fresh snapshot should apply");
        };
        assert_eq!(after.count, 2);
        assert_eq!(c.try_decrement(&now).unwrap(), Cas::Conflict);
    }

    #[test]
    fn decrement_floors_at_zero() {
        let (_store, c) = counter();
        assert_eq!(c.decrement(), Some(0));
        assert_eq!(c.decrement(), Some(0));
        assert_eq!(c.read_count(), 0);
    }

    #[test]
    fn reserve_respects_limit() {
        let (_store, c) = counter();
        assert!(matches!(c.try_reserve(2).unwrap(), Reservation::Reserved(_)));
        assert!(matches!(c.try_reserve(2).unwrap(), Reservation::Reserved(_)));
        assert_eq!(c.try_reserve(2).unwrap(), Reservation::AtCapacity(2));
        assert_eq!(c.read_count(), 2);
    }

    #[test]
    fn reset_overwrites_anything() {
        let (store, c) = counter();
        store
            .put(DEFAULT_COUNTER_KEY, br#"{"count":7}"#.to_vec(), Precondition::None)
            .unwrap();
        c.reset().unwrap();
        assert_eq!(c.read_count(), 0);
        assert!(c.read().unwrap().version.is_some());
    }
}
