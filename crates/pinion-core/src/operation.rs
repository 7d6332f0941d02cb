use crate::lifecycle::OperationKind;
use pinion_schema::{OperationId, PackageId};
use pinion_store::FailureInfo;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Where an operation stands. Everything but `Pending` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Succeeded {
        #[serde(
            default,
            rename = "tunnelUrl",
            skip_serializing_if = "Option::is_none"
        )]
        tunnel_url: Option<String>,
    },
    Failed {
        error: FailureInfo,
    },
    Cancelled,
}

impl Outcome {
    pub fn succeeded() -> Self {
        Outcome::Succeeded { tunnel_url: None }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub operation_id: OperationId,
    pub package_id: PackageId,
    pub kind: OperationKind,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub submitted_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl OperationReport {
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }

    pub fn tunnel_url(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Succeeded { tunnel_url } => tunnel_url.as_deref(),
            _ => None,
        }
    }
}

/// Orchestrator-side bookkeeping for one submitted operation.
pub(crate) struct OperationEntry {
    kind: OperationKind,
    cancel: watch::Sender<bool>,
    report: watch::Sender<OperationReport>,
}

impl OperationEntry {
    pub(crate) fn new(operation_id: OperationId, package_id: PackageId, kind: OperationKind) -> Self {
        let report = OperationReport {
            operation_id,
            package_id,
            kind,
            outcome: Outcome::Pending,
            submitted_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
        };
        Self {
            kind,
            cancel: watch::Sender::new(false),
            report: watch::Sender::new(report),
        }
    }

    pub(crate) fn report(&self) -> OperationReport {
        self.report.borrow().clone()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.report.borrow().is_terminal()
    }

    pub(crate) fn watch_report(&self) -> watch::Receiver<OperationReport> {
        self.report.subscribe()
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        CancelToken(self.cancel.subscribe())
    }

    /// Ask the supervising task to stop. False if the operation already
    /// finished or cannot be cancelled.
    pub(crate) fn request_cancel(&self) -> bool {
        if !self.kind.is_cancellable() || self.is_terminal() {
            return false;
        }
        !self.cancel.send_replace(true)
    }

    /// Record the terminal outcome. Only the first call has an effect.
    pub(crate) fn finish(&self, outcome: Outcome) -> OperationReport {
        self.report.send_if_modified(|report| {
            if report.is_terminal() {
                return false;
            }
            report.outcome = outcome;
            report.finished_at = Some(chrono::Utc::now().to_rfc3339());
            true
        });
        self.report()
    }
}

pub(crate) struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    pub(crate) fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves otherwise.
    pub(crate) async fn cancelled(&mut self) {
        if self.0.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: OperationKind) -> OperationEntry {
        OperationEntry::new(OperationId::new("op"), PackageId::new("p1"), kind)
    }

    #[test]
    fn first_outcome_wins() {
        let e = entry(OperationKind::Install);
        assert!(!e.is_terminal());
        e.finish(Outcome::Cancelled);
        let report = e.finish(Outcome::succeeded());
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn cancel_only_once_and_only_while_pending() {
        let e = entry(OperationKind::Run);
        let token = e.cancel_token();
        assert!(!token.is_cancelled());
        assert!(e.request_cancel());
        assert!(token.is_cancelled());
        assert!(!e.request_cancel());

        let done = entry(OperationKind::Install);
        done.finish(Outcome::succeeded());
        assert!(!done.request_cancel());
    }

    #[test]
    fn stop_and_tunnel_operations_are_not_cancellable() {
        assert!(!entry(OperationKind::Stop).request_cancel());
        assert!(!entry(OperationKind::CreateTunnel).request_cancel());
    }

    #[test]
    fn report_json_shape() {
        let e = entry(OperationKind::CreateTunnel);
        let report = e.finish(Outcome::Succeeded {
            tunnel_url: Some("https://p1-ab12.example.com".to_owned()),
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["operationId"], "op");
        assert_eq!(json["kind"], "create_tunnel");
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["tunnelUrl"], "https://p1-ab12.example.com");

        let failed = entry(OperationKind::Install).finish(Outcome::Failed {
            error: FailureInfo {
                kind: "process_crashed".to_owned(),
                message: "exit code 1".to_owned(),
                exit_code: Some(1),
                tail: Vec::new(),
            },
        });
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["exit_code"], 1);
    }

    #[tokio::test]
    async fn cancelled_resolves_after_request() {
        let e = entry(OperationKind::Install);
        let mut token = e.cancel_token();
        assert!(e.request_cancel());
        tokio::time::timeout(std::time::Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }
}
