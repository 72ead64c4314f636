use super::{DeleteOutcome, Object, ObjectStore, Precondition, Version, WriteOutcome};
use crate::error::StoreError;
use fs2::FileExt;
use log::*;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

const GUARD_FILE: &str = ".storelock";

/// Store rooted at a directory, typically on a filesystem shared by every
/// participating host.
///
/// Each operation holds an advisory lock on `<root>/.storelock` for its
/// duration (shared for reads, exclusive for writes), which makes the
/// conditional operations atomic among processes that honour the lock.
/// The version token is the hex SHA-256 of the body.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FsStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && key != GUARD_FILE
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        Ok(self.root.join(rel))
    }

    fn guard(&self, exclusive: bool) -> Result<File, StoreError> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.root.join(GUARD_FILE))?;
        if exclusive {
            f.lock_exclusive()?;
        } else {
            f.lock_shared()?;
        }

        Ok(f)
    }

    fn read_at(path: &Path) -> Result<Option<Object>, StoreError> {
        match fs::read(path) {
            Ok(body) => {
                let version = version_of(&body);
                Ok(Some(Object { body, version }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_at(path: &Path, body: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Readers never see a half-written body.
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        let mut f = File::create(&tmp)?;
        f.write_all(body)?;
        f.sync_all()?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        Ok(())
    }
}

fn version_of(body: &[u8]) -> Version {
    Version::new(format!("{:x}", Sha256::digest(body)))
}

fn unlock(f: File) {
    if let Err(e) = FileExt::unlock(&f) {
        warn!("unlock {GUARD_FILE} failed: {e}");
    }
}

impl ObjectStore for FsStore {
    fn get(&self, key: &str) -> Result<Option<Object>, StoreError> {
        let path = self.path_of(key)?;
        let g = self.guard(false)?;
        let res = Self::read_at(&path);
        unlock(g);
        res
    }

    fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        cond: Precondition,
    ) -> Result<WriteOutcome, StoreError> {
        let path = self.path_of(key)?;
        let g = self.guard(true)?;
        let res = (|| -> Result<WriteOutcome, StoreError> {
            let current = Self::read_at(&path)?.map(|o| o.version);
            let allowed = match (&cond, &current) {
                (Precondition::None, _) => true,
                (Precondition::IfAbsent, current) => current.is_none(),
                (Precondition::IfMatch(want), Some(have)) => want == have,
                (Precondition::IfMatch(_), None) => false,
            };

            if !allowed {
                return Ok(WriteOutcome::PreconditionFailed);
            }

            Self::write_at(&path, &body)?;
            Ok(WriteOutcome::Written(version_of(&body)))
        })();

        unlock(g);
        res
    }

    fn delete(&self, key: &str, expected: Option<&Version>) -> Result<DeleteOutcome, StoreError> {
        let path = self.path_of(key)?;
        let g = self.guard(true)?;
        let res = (|| -> Result<DeleteOutcome, StoreError> {
            let Some(current) = Self::read_at(&path)? else {
                return Ok(DeleteOutcome::Missing);
            };

            if expected.is_some_and(|want| *want != current.version) {
                return Ok(DeleteOutcome::PreconditionFailed);
            }

            match fs::remove_file(&path) {
                Ok(()) => Ok(DeleteOutcome::Deleted),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::Missing),
                Err(e) => Err(e.into()),
            }
        })();

        unlock(g);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        for key in ["", "../x", "/etc/passwd", "locks/../../x", ".storelock"] {
            assert!(
                matches!(store.get(key), Err(StoreError::InvalidKey(_))),
                "{key} should be rejected"
            );
        }
    }

    #[test]
    fn nested_keys_create_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let out = store.put("locks/jobX", vec![], Precondition::IfAbsent).unwrap();
        assert!(matches!(out, WriteOutcome::Written(_)));
        assert!(dir.path().join("locks").join("jobX").exists());

        let again = store.put("locks/jobX", vec![], Precondition::IfAbsent).unwrap();
        assert_eq!(again, WriteOutcome::PreconditionFailed);
    }

    #[test]
    fn version_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        store
            .put("active_locks.json", br#"{"count":0}"#.to_vec(), Precondition::None)
            .unwrap();
        let seen = store.get("active_locks.json").unwrap().unwrap();

        let out = store
            .put(
                "active_locks.json",
                br#"{"count":1}"#.to_vec(),
                Precondition::IfMatch(seen.version.clone()),
            )
            .unwrap();
        assert!(matches!(out, WriteOutcome::Written(_)));

        let stale = store
            .put(
                "active_locks.json",
                br#"{"count":2}"#.to_vec(),
                Precondition::IfMatch(seen.version),
            )
            .unwrap();
        assert_eq!(stale, WriteOutcome::PreconditionFailed);
    }

    #[test]
    fn delete_is_conditional_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let WriteOutcome::Written(v) = store.put("k", b"a".to_vec(), Precondition::None).unwrap()
        else {
            panic!("write rejected");
        };

        let other = version_of(b"b");
        assert_eq!(
            store.delete("k", Some(&other)).unwrap(),
            DeleteOutcome::PreconditionFailed
        );
        assert_eq!(store.delete("k", Some(&v)).unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete("k", None).unwrap(), DeleteOutcome::Missing);
        assert!(store.get("k").unwrap().is_none());
    }
}
