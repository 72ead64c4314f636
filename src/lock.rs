use crate::clock::{Clock, SystemClock};
use crate::counter::{Cas, Counter, DEFAULT_COUNTER_KEY, Reservation};
use crate::error::{AcquireError, Blocker, ConfigError, StoreError};
use crate::policy::RetryPolicy;
use crate::store::{DeleteOutcome, ObjectStore, Precondition, Version, WriteOutcome};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const DEFAULT_PREFIX: &str = "locks/";

/// Read + CAS rounds spent handing back a slot within one attempt.
const HAND_BACK_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Polling,
    Held,
    Failed,
}

/// Diagnostic payload of a lock marker. Only the marker's existence matters
/// to the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerInfo {
    pub holder: String,
    pub acquired_at: String,
}

impl MarkerInfo {
    fn new(holder: &str) -> Self {
        let acquired_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        MarkerInfo {
            holder: holder.to_string(),
            acquired_at,
        }
    }

    /// Parsed acquisition time, if the marker carries a valid one.
    pub fn acquired_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::parse(&self.acquired_at, &Rfc3339).ok()
    }
}

/// A named lock admitting at most `limit` holders across every lock sharing
/// the same counter.
pub struct Lock {
    name: String,
    id: String,
    marker_key: String,
    limit: u64,
    policy: RetryPolicy,
    store: Arc<dyn ObjectStore>,
    counter: Counter,
    clock: Arc<dyn Clock>,
    state: LockState,
    marker_version: Option<Version>,
    /// A reserved slot that could not be handed back yet.
    owed_slot: bool,
    attempts: u32,
}

impl Lock {
    pub fn builder() -> LockBuilder {
        LockBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Holder id written into markers created by this handle.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn marker_key(&self) -> &str {
        &self.marker_key
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_held(&self) -> bool {
        self.state == LockState::Held
    }

    /// Attempts made by the last [`acquire`](Lock::acquire).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Polls with the configured policy until the lock is held or the wait
    /// budget runs out.
    pub fn acquire(&mut self) -> Result<(), AcquireError> {
        let policy = self.policy;
        self.acquire_with(&policy)
    }

    /// Boolean form of [`acquire_with`](Lock::acquire_with) with a fixed
    /// retry interval.
    pub fn acquire_for(&mut self, wait: Duration, retry_interval: Duration) -> bool {
        let policy = RetryPolicy::new(wait, retry_interval).with_backoff(self.policy.backoff);
        match self.acquire_with(&policy) {
            Ok(()) => true,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    pub fn acquire_with(&mut self, policy: &RetryPolicy) -> Result<(), AcquireError> {
        if self.is_held() {
            return Err(AcquireError::AlreadyHeld(self.name.clone()));
        }

        self.state = LockState::Polling;
        self.attempts = 0;
        let start = self.clock.now();
        // No representable deadline means the budget is effectively unbounded.
        let deadline = start.checked_add(policy.wait);
        let mut pause = policy.pacer();
        let mut last = None;

        while deadline.is_none_or(|d| self.clock.now() < d) {
            self.attempts += 1;
            match self.try_acquire() {
                Ok(()) => {
                    info!(
                        "lock '{}' acquired after {} attempt(s)",
                        self.name, self.attempts
                    );
                    return Ok(());
                }
                Err(b) => {
                    debug!("lock '{}' attempt {}: {b}", self.name, self.attempts);
                    last = Some(b);
                }
            }

            let next = pause();
            let nap = match deadline {
                None => next,
                Some(d) => match d.checked_duration_since(self.clock.now()) {
                    Some(left) if !left.is_zero() => next.min(left),
                    _ => break,
                },
            };

            self.clock.sleep(nap);
        }

        self.state = LockState::Failed;
        let err = AcquireError::Timeout {
            name: self.name.clone(),
            waited: self.clock.now().saturating_duration_since(start),
            attempts: self.attempts,
            last,
        };

        warn!("{err}");
        Err(err)
    }

    /// One pass of the protocol: check the marker is free, reserve a counter
    /// slot under the limit, then create the marker. A slot whose marker
    /// could not be created is handed back before returning.
    pub fn try_acquire(&mut self) -> Result<(), Blocker> {
        if self.owed_slot && !self.hand_back() {
            return Err(Blocker::Transient(
                "previous counter slot not handed back yet".to_string(),
            ));
        }

        match self.store.get(&self.marker_key) {
            Ok(Some(_)) => return Err(Blocker::Contended),
            Ok(None) => {}
            Err(e) => return Err(Blocker::Transient(e.to_string())),
        }

        match self.counter.try_reserve(self.limit) {
            Ok(Reservation::Reserved(_)) => {}
            Ok(Reservation::AtCapacity(active)) => {
                return Err(Blocker::AtCapacity {
                    active,
                    limit: self.limit,
                });
            }
            Ok(Reservation::Conflict) => return Err(Blocker::Contended),
            Err(e) => return Err(Blocker::Transient(e.to_string())),
        }

        match self.create_marker() {
            Ok(Some(version)) => {
                self.marker_version = Some(version);
                self.state = LockState::Held;
                Ok(())
            }
            Ok(None) => {
                self.hand_back();
                Err(Blocker::Contended)
            }
            Err(e) => {
                self.hand_back();
                Err(Blocker::Transient(e.to_string()))
            }
        }
    }

    /// Returns a reserved slot to the counter, retrying conflicts and store
    /// errors alike. A slot still unreturned is remembered and paid back
    /// before the next attempt reserves again.
    fn hand_back(&mut self) -> bool {
        for _ in 0..HAND_BACK_ROUNDS {
            match self
                .counter
                .read()
                .and_then(|seen| self.counter.try_decrement(&seen))
            {
                Ok(Cas::Updated(_)) => {
                    self.owed_slot = false;
                    return true;
                }
                Ok(Cas::Conflict) => continue,
                Err(e) => debug!("lock '{}' hand back slot: {e}", self.name),
            }
        }

        warn!(
            "lock '{}' could not hand back its counter slot, will retry",
            self.name
        );
        self.owed_slot = true;
        false
    }

    fn create_marker(&self) -> Result<Option<Version>, StoreError> {
        let body = serde_json::to_vec(&MarkerInfo::new(&self.id))
            .map_err(|e| StoreError::Backend(format!("encode marker: {e}")))?;
        match self
            .store
            .put(&self.marker_key, body, Precondition::IfAbsent)?
        {
            WriteOutcome::Written(v) => Ok(Some(v)),
            WriteOutcome::PreconditionFailed => Ok(None),
        }
    }

    /// Deletes the marker this handle created and gives back the counter
    /// slot. Never fails; problems are logged.
    ///
    /// Only the marker version this handle wrote is deleted, and the counter
    /// is decremented only when that delete happened. On a handle that does
    /// not hold the lock this does nothing; use
    /// [`force_release`](Lock::force_release) to evict another holder.
    pub fn release(&mut self) {
        if self.owed_slot {
            self.hand_back();
        }

        let Some(expected) = self.marker_version.take() else {
            debug!("lock '{}' not held here, nothing to release", self.name);
            return;
        };

        match self.store.delete(&self.marker_key, Some(&expected)) {
            Ok(DeleteOutcome::Deleted) => {
                let active = self.counter.decrement();
                info!(
                    "lock '{}' released (active={})",
                    self.name,
                    active.map_or_else(|| "?".to_string(), |v| v.to_string())
                );
            }
            Ok(DeleteOutcome::Missing) => {
                warn!("lock '{}' marker was removed by someone else", self.name);
            }
            Ok(DeleteOutcome::PreconditionFailed) => {
                warn!(
                    "lock '{}' marker now belongs to another holder, leaving it",
                    self.name
                );
            }
            Err(e) => {
                error!("release lock '{}' failed: {e}", self.name);
                // Still ours as far as we know; a later release can retry.
                self.marker_version = Some(expected);
                return;
            }
        }

        self.state = LockState::Idle;
    }

    /// Deletes whatever marker exists under this name, whoever created it,
    /// and gives back the evicted holder's counter slot. That holder's own
    /// release later finds its marker gone and decrements nothing.
    pub fn force_release(&mut self) {
        if self.marker_version.is_some() {
            self.release();
            return;
        }

        match self.store.delete(&self.marker_key, None) {
            Ok(DeleteOutcome::Deleted) => {
                let active = self.counter.decrement();
                info!(
                    "lock '{}' forcibly released (active={})",
                    self.name,
                    active.map_or_else(|| "?".to_string(), |v| v.to_string())
                );
            }
            Ok(DeleteOutcome::Missing) | Ok(DeleteOutcome::PreconditionFailed) => {
                debug!("lock '{}' already released", self.name);
            }
            Err(e) => error!("force release lock '{}' failed: {e}", self.name),
        }
    }

    /// Whether any holder currently has this lock name.
    pub fn is_locked(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(&self.marker_key)?.is_some())
    }

    /// Marker payload of the current holder, if any.
    pub fn holder(&self) -> Result<Option<MarkerInfo>, StoreError> {
        Ok(self
            .store
            .get(&self.marker_key)?
            .and_then(|o| serde_json::from_slice(&o.body).ok()))
    }
}

#[derive(Default)]
pub struct LockBuilder {
    store: Option<Arc<dyn ObjectStore>>,
    name: String,
    id: Option<String>,
    prefix: Option<String>,
    counter_key: Option<String>,
    limit: Option<u64>,
    policy: RetryPolicy,
    clock: Option<Arc<dyn Clock>>,
}

impl LockBuilder {
    pub fn new() -> LockBuilder {
        LockBuilder::default()
    }

    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> LockBuilder {
        self.store = Some(store);
        self
    }

    pub fn name(mut self, name: String) -> LockBuilder {
        self.name = name;
        self
    }

    /// Holder id; a random UUID when unset.
    pub fn id(mut self, id: String) -> LockBuilder {
        self.id = Some(id);
        self
    }

    /// Key prefix for markers, `locks/` by default.
    pub fn prefix(mut self, prefix: String) -> LockBuilder {
        self.prefix = Some(prefix);
        self
    }

    pub fn counter_key(mut self, key: String) -> LockBuilder {
        self.counter_key = Some(key);
        self
    }

    /// Maximum concurrent holders sharing the counter. Defaults to 1.
    pub fn limit(mut self, limit: u64) -> LockBuilder {
        self.limit = Some(limit);
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> LockBuilder {
        self.policy = policy;
        self
    }

    pub fn wait(mut self, wait: Duration) -> LockBuilder {
        self.policy.wait = wait;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> LockBuilder {
        self.policy.retry_interval = interval;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> LockBuilder {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Lock, ConfigError> {
        let store = self.store.ok_or(ConfigError::MissingStore)?;
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let limit = match self.limit {
            None => 1,
            Some(0) => return Err(ConfigError::ZeroLimit),
            Some(n) => n,
        };

        if self.policy.retry_interval.is_zero() {
            return Err(ConfigError::ZeroRetryInterval);
        }

        let prefix = self.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        let counter_key = self
            .counter_key
            .unwrap_or_else(|| DEFAULT_COUNTER_KEY.to_string());
        Ok(Lock {
            marker_key: format!("{prefix}{}", self.name),
            name: self.name,
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            limit,
            policy: self.policy,
            counter: Counter::new(store.clone(), counter_key),
            store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            state: LockState::Idle,
            marker_version: None,
            owed_slot: false,
            attempts: 0,
        })
    }
}
