use crate::layout::StoreLayout;
use crate::record::PackageRecord;
use crate::{write_atomic, StateStore, StoreError};
use pinion_schema::validate_package_id;
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// File-backed [`StateStore`]: one JSON document per package under
/// `<root>/store/packages/`, replaced atomically on every write.
pub struct FileStateStore {
    layout: StoreLayout,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStateStore {
    /// Open (and initialize if needed) the store rooted at `layout`.
    pub fn open(layout: StoreLayout) -> Result<Self, StoreError> {
        layout.initialize()?;
        Ok(Self {
            layout,
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn key_lock(&self, package: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(package.to_owned()).or_default())
    }

    fn read(&self, package: &str) -> Result<Option<PackageRecord>, StoreError> {
        let path = self.layout.record_path(package);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: PackageRecord = serde_json::from_str(&content)?;
        record.verify_checksum()?;
        Ok(Some(record))
    }

    fn write(&self, record: &PackageRecord) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.layout.record_path(&record.package_id), &content)
    }

    fn record_names(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.packages_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Temp files from interrupted writes start with a dot.
            match entry.file_name().to_str() {
                Some(name) if !name.starts_with('.') => names.push(name.to_owned()),
                _ => {}
            }
        }
        names.sort();
        Ok(names)
    }

    /// Records that fail to parse or whose checksum does not match.
    pub fn verify(&self) -> Result<Vec<(String, StoreError)>, StoreError> {
        let mut failures = Vec::new();
        for name in self.record_names()? {
            if let Err(e) = self.read(&name) {
                failures.push((name, e));
            }
        }
        Ok(failures)
    }
}

impl StateStore for FileStateStore {
    fn get(&self, package: &str) -> Result<Option<PackageRecord>, StoreError> {
        validate_package_id(package)?;
        self.read(package)
    }

    fn put(
        &self,
        record: &PackageRecord,
        expected_version: u64,
    ) -> Result<PackageRecord, StoreError> {
        validate_package_id(&record.package_id)?;
        let lock = self.key_lock(&record.package_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let found = self.read(&record.package_id)?.map_or(0, |r| r.version);
        if found != expected_version {
            return Err(StoreError::Conflict {
                package: record.package_id.to_string(),
                expected: expected_version,
                found,
            });
        }

        let mut stored = record.clone();
        stored.version = expected_version + 1;
        stored.checksum = None;
        stored.checksum = Some(stored.compute_checksum()?);
        self.write(&stored)?;
        debug!(
            "stored {} v{} ({})",
            stored.package_id, stored.version, stored.phase
        );
        Ok(stored)
    }

    fn list(&self) -> Result<Vec<PackageRecord>, StoreError> {
        let mut records = Vec::new();
        for name in self.record_names()? {
            match self.read(&name) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("skipping corrupted record '{name}': {e}"),
            }
        }
        Ok(records)
    }

    fn remove(&self, package: &str) -> Result<(), StoreError> {
        validate_package_id(package)?;
        let lock = self.key_lock(package);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(self.layout.record_path(package)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LifecyclePhase;
    use pinion_schema::PackageId;

    fn test_store() -> (tempfile::TempDir, FileStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(StoreLayout::new(dir.path())).unwrap();
        (dir, store)
    }

    fn record(id: &str) -> PackageRecord {
        PackageRecord::new(PackageId::new(id), 20)
    }

    #[test]
    fn missing_record_is_none() {
        let (_dir, store) = test_store();
        assert!(store.get("nothing").unwrap().is_none());
    }

    #[test]
    fn put_then_get() {
        let (_dir, store) = test_store();
        let mut r = record("p1");
        r.phase = LifecyclePhase::Installing;
        r.log_tail.push("cloning");
        let stored = store.put(&r, 0).unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.checksum.is_some());

        let back = store.get("p1").unwrap().unwrap();
        assert_eq!(back.phase, LifecyclePhase::Installing);
        assert_eq!(back.version, 1);
        assert_eq!(back.log_tail.last(1), vec!["cloning".to_owned()]);
    }

    #[test]
    fn stale_version_conflicts() {
        let (_dir, store) = test_store();
        let r = record("p1");
        store.put(&r, 0).unwrap();
        store.put(&r, 1).unwrap();
        let err = store.put(&r, 1).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn invalid_key_is_rejected() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.get("../escape"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(store.put(&record("../escape"), 0).is_err());
    }

    #[test]
    fn list_skips_corrupted_and_temp_files() {
        let (_dir, store) = test_store();
        store.put(&record("a"), 0).unwrap();
        store.put(&record("b"), 0).unwrap();
        fs::write(store.layout().record_path("c"), "{not json").unwrap();
        fs::write(store.layout().packages_dir().join(".tmpXYZ"), "junk").unwrap();

        let ids: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.package_id.into_inner())
            .collect();
        assert_eq!(ids, vec!["a".to_owned(), "b".to_owned()]);

        let failures = store.verify().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "c");
    }

    #[test]
    fn tampered_record_fails_integrity() {
        let (_dir, store) = test_store();
        store.put(&record("p1"), 0).unwrap();
        let path = store.layout().record_path("p1");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"install_progress\": 0", "\"install_progress\": 99"))
            .unwrap();
        assert!(matches!(
            store.get("p1"),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, store) = test_store();
        store.put(&record("p1"), 0).unwrap();
        store.remove("p1").unwrap();
        store.remove("p1").unwrap();
        assert!(store.get("p1").unwrap().is_none());
    }
}
