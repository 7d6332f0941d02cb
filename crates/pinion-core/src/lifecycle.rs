use crate::CoreError;
use pinion_store::LifecyclePhase;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Install,
    Run,
    Stop,
    CreateTunnel,
    CloseTunnel,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Install,
        OperationKind::Run,
        OperationKind::Stop,
        OperationKind::CreateTunnel,
        OperationKind::CloseTunnel,
    ];

    pub fn is_tunnel(self) -> bool {
        matches!(self, OperationKind::CreateTunnel | OperationKind::CloseTunnel)
    }

    /// Install and Run supervise a process that cancellation can terminate.
    pub fn is_cancellable(self) -> bool {
        matches!(self, OperationKind::Install | OperationKind::Run)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Install => "install",
            OperationKind::Run => "run",
            OperationKind::Stop => "stop",
            OperationKind::CreateTunnel => "create_tunnel",
            OperationKind::CloseTunnel => "close_tunnel",
        };
        f.write_str(s)
    }
}

/// Phase a request moves the package into when accepted. `None` means the
/// request is accepted without a phase change (tunnel operations).
pub fn plan_transition(
    from: LifecyclePhase,
    requested: OperationKind,
) -> Result<Option<LifecyclePhase>, CoreError> {
    use LifecyclePhase as P;
    use OperationKind as K;

    let target = match (from, requested) {
        (P::NotInstalled | P::Installed | P::InstallFailed | P::RunFailed, K::Install) => {
            Some(P::Installing)
        }
        (P::Installed | P::RunFailed, K::Run) => Some(P::Starting),
        (P::Running, K::Stop) => Some(P::Stopping),
        (P::Running, K::CreateTunnel | K::CloseTunnel) => None,
        _ => return Err(CoreError::InvalidTransition { from, requested }),
    };
    Ok(target)
}

/// Every phase edge the orchestrator may take, request-driven or process-driven.
pub fn validate_transition(from: LifecyclePhase, to: LifecyclePhase) -> Result<(), String> {
    use LifecyclePhase as P;

    let valid = matches!(
        (from, to),
        (
            P::NotInstalled | P::Installed | P::InstallFailed | P::RunFailed,
            P::Installing
        ) | (P::Installing, P::Installed | P::InstallFailed)
            | (P::Installed | P::RunFailed, P::Starting)
            | (P::Starting, P::Running | P::RunFailed)
            | (P::Running, P::Stopping | P::RunFailed)
            | (P::Stopping, P::Installed)
    );
    if valid {
        Ok(())
    } else {
        Err(format!("invalid state transition: {from} -> {to}"))
    }
}
