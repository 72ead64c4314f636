use super::{DeleteOutcome, Object, ObjectStore, Precondition, Version, WriteOutcome};
use crate::error::StoreError;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug)]
struct Entry {
    body: Vec<u8>,
    generation: u64,
}

/// In-process store. Every write bumps a store-wide generation that serves
/// as the version token, so tokens are never reused for a key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, Entry>,
    generation: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A poisoned map is still consistent: every mutation is a single insert
    // or remove.
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn version_of(generation: u64) -> Version {
    Version::new(generation.to_string())
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Object>, StoreError> {
        let inner = self.lock();
        Ok(inner.objects.get(key).map(|e| Object {
            body: e.body.clone(),
            version: version_of(e.generation),
        }))
    }

    fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        cond: Precondition,
    ) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.lock();
        let current = inner.objects.get(key).map(|e| version_of(e.generation));
        let allowed = match (&cond, &current) {
            (Precondition::None, _) => true,
            (Precondition::IfAbsent, None) => true,
            (Precondition::IfAbsent, Some(_)) => false,
            (Precondition::IfMatch(want), Some(have)) => want == have,
            (Precondition::IfMatch(_), None) => false,
        };

        if !allowed {
            return Ok(WriteOutcome::PreconditionFailed);
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner
            .objects
            .insert(key.to_string(), Entry { body, generation });
        Ok(WriteOutcome::Written(version_of(generation)))
    }

    fn delete(&self, key: &str, expected: Option<&Version>) -> Result<DeleteOutcome, StoreError> {
        let mut inner = self.lock();
        let Some(entry) = inner.objects.get(key) else {
            return Ok(DeleteOutcome::Missing);
        };

        if let Some(want) = expected {
            if *want != version_of(entry.generation) {
                return Ok(DeleteOutcome::PreconditionFailed);
            }
        }

        inner.objects.remove(key);
        Ok(DeleteOutcome::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(o: WriteOutcome) -> Version {
        match o {
            WriteOutcome::Written(v) => v,
            WriteOutcome::PreconditionFailed => panic!("write was rejected"),
        }
    }

    #[test]
    fn create_if_absent_only_once() {
        let store = MemoryStore::new();
        let first = store.put("locks/a", vec![], Precondition::IfAbsent).unwrap();
        assert!(matches!(first, WriteOutcome::Written(_)));

        let second = store.put("locks/a", vec![1], Precondition::IfAbsent).unwrap();
        assert_eq!(second, WriteOutcome::PreconditionFailed);
        assert_eq!(store.get("locks/a").unwrap().unwrap().body, Vec::<u8>::new());
    }

    #[test]
    fn if_match_rejects_stale_version() {
        let store = MemoryStore::new();
        let v1 = written(store.put("c", b"1".to_vec(), Precondition::None).unwrap());
        let v2 = written(
            store
                .put("c", b"2".to_vec(), Precondition::IfMatch(v1.clone()))
                .unwrap(),
        );
        assert_ne!(v1, v2);

        let stale = store.put("c", b"3".to_vec(), Precondition::IfMatch(v1)).unwrap();
        assert_eq!(stale, WriteOutcome::PreconditionFailed);
        assert_eq!(store.get("c").unwrap().unwrap().body, b"2".to_vec());
    }

    #[test]
    fn if_match_on_missing_key_fails() {
        let store = MemoryStore::new();
        let out = store
            .put("c", vec![], Precondition::IfMatch(Version::new("1")))
            .unwrap();
        assert_eq!(out, WriteOutcome::PreconditionFailed);
        assert!(store.is_empty());
    }

    #[test]
    fn versions_are_not_reused_after_delete() {
        let store = MemoryStore::new();
        let v1 = written(store.put("k", vec![], Precondition::IfAbsent).unwrap());
        store.delete("k", None).unwrap();
        let v2 = written(store.put("k", vec![], Precondition::IfAbsent).unwrap());
        assert_ne!(v1, v2);
    }

    #[test]
    fn conditional_delete() {
        let store = MemoryStore::new();
        let v = written(store.put("k", vec![], Precondition::None).unwrap());
        assert_eq!(
            store.delete("k", Some(&Version::new("nope"))).unwrap(),
            DeleteOutcome::PreconditionFailed
        );
        assert_eq!(store.delete("k", Some(&v)).unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete("k", None).unwrap(), DeleteOutcome::Missing);
    }
}
