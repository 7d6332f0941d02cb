//! Catalog, identifiers, and configuration for Pinion.
//!
//! This crate defines the schema layer: the immutable package metadata read
//! from the catalog file (`Catalog`, `Package`), validated identifier newtypes
//! (`PackageId`, `OperationId`), and the TOML orchestrator configuration
//! (`PinionConfig`).

pub mod catalog;
pub mod config;
pub mod types;

pub use catalog::{Catalog, CatalogEntry, CatalogError, Package, DEFAULT_PORT};
pub use config::{expand_tilde, ConfigError, PinionConfig};
pub use types::{validate_package_id, InvalidId, OperationId, PackageId};
