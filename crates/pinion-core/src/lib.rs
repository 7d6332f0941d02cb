//! Lifecycle orchestration for Pinion app packages.
//!
//! This crate ties together the catalog, the state store, and the runtime
//! backends into the `Orchestrator`: the single owner of per-package
//! lifecycle state. It validates transitions, runs install/run/stop/tunnel
//! operations as supervised cancellable tasks, publishes progress and log
//! events on the `EventBus`, and keeps tunnels idempotent per package.

pub mod concurrency;
pub mod events;
pub mod lifecycle;
pub mod operation;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod tunnel;

pub use concurrency::{install_signal_handler, shutdown_requested, StoreLock};
pub use events::{Event, EventBus, EventKind, Subscription};
pub use lifecycle::{plan_transition, validate_transition, OperationKind};
pub use operation::{OperationReport, Outcome};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, PackageSnapshot, PackageSummary, SystemStatus,
};
pub use tunnel::TunnelManager;

use pinion_schema::{OperationId, PackageId};
use pinion_store::{FailureInfo, LifecyclePhase};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("catalog error: {0}")]
    Catalog(#[from] pinion_schema::CatalogError),
    #[error("config error: {0}")]
    Config(#[from] pinion_schema::ConfigError),
    #[error("{0}")]
    InvalidId(#[from] pinion_schema::InvalidId),
    #[error("store error: {0}")]
    Store(#[from] pinion_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] pinion_runtime::RuntimeError),
    #[error("cannot {requested} while {from}")]
    InvalidTransition {
        from: LifecyclePhase,
        requested: OperationKind,
    },
    #[error("{package} already has operation {operation} in flight")]
    AlreadyInProgress {
        package: PackageId,
        operation: OperationId,
    },
    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("operation not found: {0}")]
    OperationNotFound(String),
    #[error("process runner '{0}' is unavailable")]
    RunnerUnavailable(String),
    #[error("failed to start process: {0}")]
    ProcessSpawnFailure(String),
    #[error("process crashed: {reason}")]
    ProcessCrashed {
        exit_code: Option<i32>,
        reason: String,
        tail: Vec<String>,
    },
    #[error("tunnel unavailable: {0}")]
    TunnelUnavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("state store version conflict for {0}")]
    StoreConflict(String),
    #[error("state directory is locked by another pinion process: {0}")]
    Locked(String),
    #[error("no tokio runtime available to drive operations")]
    NoRuntime,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Stable machine-readable name, used in failure records and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Catalog(_) => "catalog",
            CoreError::Config(_) => "config",
            CoreError::InvalidId(_) => "invalid_id",
            CoreError::Store(_) => "store",
            CoreError::Runtime(_) => "runtime",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::AlreadyInProgress { .. } => "already_in_progress",
            CoreError::PackageNotFound(_) => "package_not_found",
            CoreError::OperationNotFound(_) => "operation_not_found",
            CoreError::RunnerUnavailable(_) => "runner_unavailable",
            CoreError::ProcessSpawnFailure(_) => "process_spawn_failure",
            CoreError::ProcessCrashed { .. } => "process_crashed",
            CoreError::TunnelUnavailable(_) => "tunnel_unavailable",
            CoreError::Timeout(_) => "timeout",
            CoreError::StoreConflict(_) => "store_conflict",
            CoreError::Locked(_) => "locked",
            CoreError::NoRuntime => "no_runtime",
            CoreError::Io(_) => "io",
            CoreError::Serialization(_) => "serialization",
        }
    }

    pub fn to_failure(&self) -> FailureInfo {
        let (exit_code, tail) = match self {
            CoreError::ProcessCrashed {
                exit_code, tail, ..
            } => (*exit_code, tail.clone()),
            _ => (None, Vec::new()),
        };
        FailureInfo {
            kind: self.kind().to_owned(),
            message: self.to_string(),
            exit_code,
            tail,
        }
    }
}
