//! A bounded-concurrency distributed lock coordinated through a shared object
//! store.
//!
//! Processes that can all reach the same store agree that at most `limit` of
//! them run at once, with no channel between them other than the store. A
//! lock is a marker object at `locks/<name>`; a shared `{"count": n}` record
//! counts the holders across every lock name using it. Both are only ever
//! written with conditional operations (create-if-absent and compare-and-swap
//! on a version token).
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use storelock::{FsStore, Lock, run_locked};
//!
//! let store = Arc::new(FsStore::new("/mnt/shared/locks").unwrap());
//! let mut lock = Lock::builder()
//!     .store(store)
//!     .name("nightly-report".to_string())
//!     .limit(1)
//!     .wait(Duration::from_secs(30))
//!     .retry_interval(Duration::from_secs(2))
//!     .build()
//!     .unwrap();
//!
//! match run_locked(&mut lock, || println!("working")) {
//!     Ok(()) => {}
//!     Err(e) => eprintln!("job skipped: {e}"),
//! }
//! ```

pub mod clock;
pub mod counter;
pub mod error;
pub mod harness;
pub mod lock;
pub mod policy;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{Counter, DEFAULT_COUNTER_KEY};
pub use error::{AcquireError, Blocker, ConfigError, StoreError};
pub use harness::run_locked;
pub use lock::{DEFAULT_PREFIX, Lock, LockBuilder, LockState, MarkerInfo};
pub use policy::{Backoff, RetryPolicy};
pub use store::{FsStore, MemoryStore, ObjectStore, SpannerStore};
