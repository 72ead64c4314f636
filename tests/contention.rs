use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use storelock::{FsStore, Lock, MemoryStore, ObjectStore};

fn lock(store: Arc<dyn ObjectStore>, name: &str, limit: u64, wait_ms: u64) -> Lock {
    Lock::builder()
        .store(store)
        .name(name.to_string())
        .limit(limit)
        .wait(Duration::from_millis(wait_ms))
        .retry_interval(Duration::from_millis(5))
        .build()
        .unwrap()
}

/// Spawns `workers` threads that each try to run once under `limit`, and
/// returns (peak concurrent holders, successful runs).
fn race(
    store: Arc<dyn ObjectStore>,
    workers: usize,
    limit: u64,
    same_name: bool,
) -> (usize, usize) {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let store = store.clone();
            let (active, peak, runs, start) =
                (active.clone(), peak.clone(), runs.clone(), start.clone());
            thread::spawn(move || {
                let name = if same_name {
                    "jobX".to_string()
                } else {
                    format!("job{i}")
                };
                let mut l = lock(store, &name, limit, 5_000);
                start.wait();
                let res = storelock::run_locked(&mut l, || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
                if res.is_ok() {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    (peak.load(Ordering::SeqCst), runs.load(Ordering::SeqCst))
}

#[test]
fn memory_store_never_exceeds_limit() {
    let store = Arc::new(MemoryStore::new());
    let (peak, runs) = race(store.clone(), 8, 2, false);
    assert!(peak <= 2, "peak {peak} exceeded limit");
    assert_eq!(runs, 8);

    let l = lock(store, "job0", 2, 0);
    assert_eq!(l.counter().read_count(), 0);
}

#[test]
fn memory_store_same_name_is_exclusive() {
    let store = Arc::new(MemoryStore::new());
    let (peak, runs) = race(store, 6, 3, true);
    assert_eq!(peak, 1);
    assert_eq!(runs, 6);
}

#[test]
fn fs_store_never_exceeds_limit() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsStore::new(dir.path()).unwrap());
    let (peak, runs) = race(store.clone(), 6, 1, false);
    assert_eq!(peak, 1);
    assert_eq!(runs, 6);
    assert!(!dir.path().join("locks").join("job0").exists());
}

#[test]
fn loser_waits_for_winner_to_release() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let mut first = lock(store.clone(), "jobX", 1, 1_000);
    assert!(first.acquire().is_ok());

    let waiter = {
        let store = store.clone();
        thread::spawn(move || {
            let mut second = lock(store, "jobX", 1, 5_000);
            let ok = second.acquire().is_ok();
            (ok, second.attempts())
        })
    };

    thread::sleep(Duration::from_millis(50));
    first.release();

    let (ok, attempts) = waiter.join().unwrap();
    assert!(ok);
    assert!(attempts > 1, "second caller should have retried");
}

#[test]
fn loser_gives_up_at_deadline() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let mut first = lock(store.clone(), "jobX", 1, 1_000);
    assert!(first.acquire().is_ok());

    let mut second = lock(store, "jobX", 1, 50);
    assert!(second.acquire().is_err());
    assert!(first.is_held());
    assert!(first.is_locked().unwrap());
}
