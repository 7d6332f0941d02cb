use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Bumped whenever the record format changes incompatibly.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Directory layout of a Pinion state directory.
///
/// ```text
/// <root>/store/version
/// <root>/store/.lock
/// <root>/store/packages/<id>
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

/// Contents of `store/version`.
#[derive(Debug, Serialize, Deserialize)]
struct FormatMarker {
    format_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_by: Option<String>,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn packages_dir(&self) -> PathBuf {
        self.store_dir().join("packages")
    }

    #[inline]
    pub fn record_path(&self, package: &str) -> PathBuf {
        self.packages_dir().join(package)
    }

    /// Held by a running orchestrator so two processes never share a store.
    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.store_dir().join(".lock")
    }

    fn marker_path(&self) -> PathBuf {
        self.store_dir().join("version")
    }

    /// Create the directory tree and format marker, or check the marker of
    /// an existing store.
    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.packages_dir())?;
        if self.marker_path().exists() {
            return self.verify_version();
        }
        let marker = FormatMarker {
            format_version: STORE_FORMAT_VERSION,
            created_by: Some(format!("pinion {}", env!("CARGO_PKG_VERSION"))),
        };
        crate::write_atomic(&self.marker_path(), &serde_json::to_vec_pretty(&marker)?)
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let marker: FormatMarker = serde_json::from_slice(&fs::read(self.marker_path())?)?;
        match marker.format_version {
            STORE_FORMAT_VERSION => Ok(()),
            found => Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found,
            }),
        }
    }
}
