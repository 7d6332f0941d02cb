use crate::StoreError;
use pinion_schema::PackageId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

pub const DEFAULT_LOG_TAIL: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    NotInstalled,
    Installing,
    Installed,
    InstallFailed,
    Starting,
    Running,
    Stopping,
    RunFailed,
}

impl LifecyclePhase {
    pub const ALL: [LifecyclePhase; 8] = [
        LifecyclePhase::NotInstalled,
        LifecyclePhase::Installing,
        LifecyclePhase::Installed,
        LifecyclePhase::InstallFailed,
        LifecyclePhase::Starting,
        LifecyclePhase::Running,
        LifecyclePhase::Stopping,
        LifecyclePhase::RunFailed,
    ];

    /// Phases in which the orchestrator holds a live process handle.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            LifecyclePhase::Starting | LifecyclePhase::Running | LifecyclePhase::Stopping
        )
    }

    /// Whether the package's files are on disk.
    pub fn is_installed(self) -> bool {
        !matches!(
            self,
            LifecyclePhase::NotInstalled | LifecyclePhase::Installing | LifecyclePhase::InstallFailed
        )
    }

    pub fn is_running(self) -> bool {
        self == LifecyclePhase::Running
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecyclePhase::NotInstalled => "not_installed",
            LifecyclePhase::Installing => "installing",
            LifecyclePhase::Installed => "installed",
            LifecyclePhase::InstallFailed => "install_failed",
            LifecyclePhase::Starting => "starting",
            LifecyclePhase::Running => "running",
            LifecyclePhase::Stopping => "stopping",
            LifecyclePhase::RunFailed => "run_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelInfo {
    pub url: String,
    pub established_at: String,
}

/// The most recent failure recorded against a package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureInfo {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Last output lines of a crashed process.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tail: Vec<String>,
}

/// Bounded window over the most recent log lines. Oldest lines are evicted first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogTail {
    capacity: usize,
    lines: VecDeque<String>,
}

impl Default for LogTail {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_TAIL)
    }
}

impl LogTail {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// The last `n` lines, oldest first.
    pub fn last(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the window size, dropping the oldest lines if it shrinks.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }
}

/// Persisted lifecycle state of one package.
///
/// Everything the orchestrator knows about a package except its live process
/// handle, which never survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageRecord {
    pub package_id: PackageId,
    pub phase: LifecyclePhase,
    pub install_progress: u8,
    #[serde(default)]
    pub progress_determinate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelInfo>,
    #[serde(default)]
    pub log_tail: LogTail,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FailureInfo>,
    pub version: u64,
    pub updated_at: String,
    /// blake3 checksum over the record with this field unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl PackageRecord {
    pub fn new(package_id: PackageId, log_tail_lines: usize) -> Self {
        Self {
            package_id,
            phase: LifecyclePhase::NotInstalled,
            install_progress: 0,
            progress_determinate: false,
            tunnel: None,
            log_tail: LogTail::with_capacity(log_tail_lines),
            last_error: None,
            version: 0,
            updated_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    pub(crate) fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    pub(crate) fn verify_checksum(&self) -> Result<(), StoreError> {
        if let Some(ref expected) = self.checksum {
            let actual = self.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    key: self.package_id.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}
