//! Durable lifecycle records for Pinion.
//!
//! This crate provides the persistence layer: `PackageRecord` (the persisted
//! part of a package's lifecycle state), the `StateStore` key-value
//! abstraction with versioned compare-and-swap writes, the file-backed
//! `FileStateStore` with atomic writes and blake3 checksums, an in-memory
//! `MemoryStateStore`, and `StoreLayout` for directory structure management.

pub mod file;
pub mod layout;
pub mod memory;
pub mod record;

pub use file::FileStateStore;
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use memory::MemoryStateStore;
pub use record::{FailureInfo, LifecyclePhase, LogTail, PackageRecord, TunnelInfo};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable on every
/// filesystem, not just ext4 with `data=ordered`.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Replace `target` with `bytes` via a synced temp file in the same directory.
pub(crate) fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = target
        .parent()
        .ok_or_else(|| std::io::Error::other(format!("{} has no parent", target.display())))?;
    let mut tmp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for record '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("version conflict for '{package}': expected {expected}, found {found}")]
    Conflict {
        package: String,
        expected: u64,
        found: u64,
    },
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid record key: {0}")]
    InvalidKey(#[from] pinion_schema::InvalidId),
}

/// Durable mapping from package id to its lifecycle record.
///
/// A missing record has version 0. `put` is a compare-and-swap: it succeeds
/// only when the stored version equals `expected_version`, and the written
/// record carries `expected_version + 1`.
pub trait StateStore: Send + Sync {
    fn get(&self, package: &str) -> Result<Option<PackageRecord>, StoreError>;

    fn put(
        &self,
        record: &PackageRecord,
        expected_version: u64,
    ) -> Result<PackageRecord, StoreError>;

    fn list(&self) -> Result<Vec<PackageRecord>, StoreError>;

    fn remove(&self, package: &str) -> Result<(), StoreError>;
}
