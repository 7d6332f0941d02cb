use crate::record::PackageRecord;
use crate::{StateStore, StoreError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

/// In-memory [`StateStore`] for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<String, PackageRecord>>,
    forced_conflicts: AtomicU32,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with [`StoreError::Conflict`], as if a
    /// concurrent writer had bumped the version.
    pub fn inject_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, package: &str) -> Result<Option<PackageRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(package).cloned())
    }

    fn put(
        &self,
        record: &PackageRecord,
        expected_version: u64,
    ) -> Result<PackageRecord, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let found = records
            .get(record.package_id.as_str())
            .map_or(0, |r| r.version);
        if found != expected_version || self.take_forced_conflict() {
            return Err(StoreError::Conflict {
                package: record.package_id.to_string(),
                expected: expected_version,
                found,
            });
        }
        let mut stored = record.clone();
        stored.version = expected_version + 1;
        records.insert(stored.package_id.to_string(), stored.clone());
        Ok(stored)
    }

    fn list(&self) -> Result<Vec<PackageRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.values().cloned().collect())
    }

    fn remove(&self, package: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(package);
        Ok(())
    }
}
