use crate::types::{validate_package_id, PackageId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Port assumed for a package's local web UI when the catalog does not say.
pub const DEFAULT_PORT: u16 = 7860;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("catalog must be a JSON object keyed by package id or an array of entries")]
    UnexpectedShape,
}

/// One entry as it appears in the catalog file.
///
/// Every field is optional; missing values are filled in by [`Package::from_entry`].
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CatalogEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub vram: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub install: Option<Vec<String>>,
    #[serde(default)]
    pub run: Option<Vec<String>>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ready_marker: Option<String>,
}

/// Immutable package metadata. The orchestrator never mutates these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    pub description: String,
    pub category: String,
    pub tags: BTreeSet<String>,
    /// Resource requirement such as minimum VRAM ("4GB+").
    pub resource_hint: Option<String>,
    pub repo_url: Option<String>,
    /// Explicit install command; overrides the clone + requirements recipe.
    pub install: Option<Vec<String>>,
    /// Explicit run command; overrides main-script detection.
    pub run: Option<Vec<String>>,
    pub port: u16,
    pub ready_marker: Option<String>,
}

impl Package {
    /// Minimal package with defaults for everything but the id and name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: PackageId::new(id),
            name: name.into(),
            description: String::new(),
            category: "Uncategorized".to_owned(),
            tags: BTreeSet::new(),
            resource_hint: None,
            repo_url: None,
            install: None,
            run: None,
            port: DEFAULT_PORT,
            ready_marker: None,
        }
    }

    pub fn from_entry(id: &str, entry: CatalogEntry) -> Self {
        // Older catalogs carry the VRAM requirement as a tag ("8GB VRAM").
        let resource_hint = entry.vram.clone().or_else(|| {
            entry
                .tags
                .iter()
                .find(|t| t.contains("GB") || t.contains("VRAM"))
                .cloned()
        });
        Self {
            id: PackageId::new(id),
            name: entry.name.unwrap_or_else(|| id.to_owned()),
            description: entry
                .description
                .unwrap_or_else(|| "No description available".to_owned()),
            category: entry
                .category
                .unwrap_or_else(|| "Uncategorized".to_owned()),
            tags: entry.tags.into_iter().collect(),
            resource_hint,
            repo_url: entry.repo_url,
            install: entry.install.filter(|argv| !argv.is_empty()),
            run: entry.run.filter(|argv| !argv.is_empty()),
            port: entry.port.unwrap_or(DEFAULT_PORT),
            ready_marker: entry.ready_marker,
        }
    }
}

/// The set of packages known to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    packages: BTreeMap<PackageId, Package>,
    source: Option<PathBuf>,
    warnings: Vec<String>,
}

impl Catalog {
    pub fn from_packages(packages: impl IntoIterator<Item = Package>) -> Self {
        Self {
            packages: packages.into_iter().map(|p| (p.id.clone(), p)).collect(),
            source: None,
            warnings: Vec::new(),
        }
    }

    /// Parse a catalog document.
    ///
    /// Accepts either `{ "<id>": {entry}, ... }` or `[ {"id": ..., ...}, ... ]`.
    /// Entries that fail to parse or carry an invalid id are skipped and
    /// recorded in [`warnings`](Self::warnings); only a wrongly shaped document
    /// is an error.
    pub fn from_json_str(input: &str) -> Result<Self, CatalogError> {
        let doc: serde_json::Value = serde_json::from_str(input)?;
        let raw: Vec<(Option<String>, serde_json::Value)> = match doc {
            serde_json::Value::Object(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
            serde_json::Value::Array(items) => items.into_iter().map(|v| (None, v)).collect(),
            _ => return Err(CatalogError::UnexpectedShape),
        };

        let mut catalog = Self::default();
        for (key, value) in raw {
            let entry: CatalogEntry = match serde_json::from_value(value) {
                Ok(e) => e,
                Err(e) => {
                    let label = key.as_deref().unwrap_or("<unnamed>");
                    catalog.warn(format!("skipping catalog entry '{label}': {e}"));
                    continue;
                }
            };
            let Some(id) = key.or_else(|| entry.id.clone()) else {
                catalog.warn("skipping catalog entry without an id".to_owned());
                continue;
            };
            if let Err(e) = validate_package_id(&id) {
                catalog.warn(format!("skipping catalog entry: {e}"));
                continue;
            }
            let package = Package::from_entry(&id, entry);
            if catalog.packages.insert(package.id.clone(), package).is_some() {
                catalog.warn(format!("duplicate catalog entry '{id}', keeping the last one"));
            }
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path)?;
        let mut catalog = Self::from_json_str(&content)?;
        catalog.source = Some(path.to_path_buf());
        Ok(catalog)
    }

    /// Load the catalog, degrading to an empty catalog on any failure.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(c) => {
                tracing::info!("loaded {} packages from {}", c.len(), path.display());
                c
            }
            Err(e) => {
                let mut empty = Self::default();
                empty.warn(format!("catalog {} unavailable: {e}", path.display()));
                empty
            }
        }
    }

    fn warn(&mut self, msg: String) {
        warn!("{msg}");
        self.warnings.push(msg);
    }

    pub fn get(&self, id: &str) -> Option<&Package> {
        self.packages.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.packages.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// File the catalog was read from; `None` for in-memory or failed loads.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn categories(&self) -> BTreeSet<&str> {
        self.packages.values().map(|p| p.category.as_str()).collect()
    }
}
