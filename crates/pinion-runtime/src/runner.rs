use crate::process::{CommandSpec, SpawnedProcess};
use crate::RuntimeError;
use std::sync::Arc;

/// Executes install, run and tunnel commands as child processes.
///
/// `spawn` must be called from within a tokio runtime; backends drive the
/// process output and exit watch on spawned tasks.
pub trait ProcessRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Health check. The orchestrator refuses install and run requests while
    /// this is false.
    fn available(&self) -> bool;

    fn spawn(&self, spec: &CommandSpec) -> Result<SpawnedProcess, RuntimeError>;
}

pub fn select_runner(name: &str) -> Result<Arc<dyn ProcessRunner>, RuntimeError> {
    match name {
        "host" => Ok(Arc::new(crate::host::HostRunner::new())),
        "mock" => Ok(Arc::new(crate::mock::MockRunner::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
