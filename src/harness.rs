use crate::error::AcquireError;
use crate::lock::Lock;
use log::*;
use scopeguard::guard;

/// Runs `job` once while holding `lock`.
///
/// The lock is released on every way out of `job`, including a panic. If the
/// lock cannot be acquired within its policy, `job` is not run.
pub fn run_locked<T, F>(lock: &mut Lock, job: F) -> Result<T, AcquireError>
where
    F: FnOnce() -> T,
{
    lock.acquire()?;
    let held = guard(lock, |lock| lock.release());
    info!("running job for lock '{}'", held.name());
    let out = job();
    info!("job for lock '{}' finished", held.name());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, ObjectStore, Precondition};
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;
    use std::time::Duration;

    fn lock_on(store: Arc<MemoryStore>) -> Lock {
        Lock::builder()
            .store(store)
            .name("jobX".to_string())
            .wait(Duration::from_secs(4))
            .retry_interval(Duration::from_secs(2))
            .clock(Arc::new(ManualClock::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn runs_job_and_releases() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock_on(store.clone());
        let seen = run_locked(&mut lock, || {
            store.get("locks/jobX").unwrap().is_some()
        })
        .unwrap();

        assert!(seen, "marker should exist while the job runs");
        assert!(store.get("locks/jobX").unwrap().is_none());
        assert_eq!(lock.counter().read_count(), 0);
    }

    #[test]
    fn releases_when_job_fails() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock_on(store.clone());
        let out: Result<Result<(), String>, _> =
            run_locked(&mut lock, || Err("job failed".to_string()));

        assert_eq!(out.unwrap(), Err("job failed".to_string()));
        assert!(!lock.is_held());
        assert!(store.get("locks/jobX").unwrap().is_none());
    }

    #[test]
    fn releases_when_job_panics() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock_on(store.clone());
        let res = catch_unwind(AssertUnwindSafe(|| {
            run_locked(&mut lock, || panic!("boom")).ok();
        }));

        assert!(res.is_err());
        assert!(store.get("locks/jobX").unwrap().is_none());
        assert_eq!(lock.counter().read_count(), 0);
    }

    #[test]
    fn skips_job_when_not_acquired() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("locks/jobX", vec![], Precondition::IfAbsent)
            .unwrap();
        let mut lock = lock_on(store.clone());
        let mut ran = false;
        let res = run_locked(&mut lock, || ran = true);

        assert!(matches!(res, Err(AcquireError::Timeout { attempts: 2, .. })));
        assert!(!ran);
        // The other holder's marker is untouched.
        assert!(store.get("locks/jobX").unwrap().is_some());
    }
}
