use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Lines buffered per process before the reader applies backpressure.
pub(crate) const OUTPUT_BUFFER: usize = 1024;

/// What a command is for. Backends may use it to pick defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandRole {
    Install,
    Run,
    Tunnel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub role: CommandRole,
    /// Package the command belongs to, for log context.
    pub label: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, role: CommandRole) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            role,
            label: String::new(),
        }
    }

    /// Build from an argv whose first element is the program.
    pub fn from_argv(argv: &[String], role: CommandRole) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), role).args(args.iter().cloned()))
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub const UNKNOWN: ExitInfo = ExitInfo {
        code: None,
        signal: None,
    };

    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Backend-specific signal delivery.
pub trait ProcessControl: Send + Sync {
    fn signal(&self, signal: Signal) -> Result<(), RuntimeError>;
}

/// Cloneable handle for signalling and awaiting a spawned process.
#[derive(Clone)]
pub struct ProcessController {
    pid: u32,
    control: Arc<dyn ProcessControl>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl fmt::Debug for ProcessController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessController")
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .finish_non_exhaustive()
    }
}

impl ProcessController {
    pub fn new(
        pid: u32,
        control: Arc<dyn ProcessControl>,
        exit: watch::Receiver<Option<ExitInfo>>,
    ) -> Self {
        Self { pid, control, exit }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Signal the process. A no-op once it has exited, so a recycled pid is
    /// never hit.
    pub fn signal(&self, signal: Signal) -> Result<(), RuntimeError> {
        if self.has_exited() {
            return Ok(());
        }
        self.control.signal(signal)
    }

    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit.clone();
        // An error means the sender is gone; the last value is final.
        let _ = rx.wait_for(Option::is_some).await;
        let exit = *rx.borrow();
        exit.unwrap_or(ExitInfo::UNKNOWN)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL and wait for exit.
    pub async fn terminate(&self, grace: Duration) -> ExitInfo {
        if let Some(exit) = self.exit_status() {
            return exit;
        }
        debug!("sending SIGTERM to pid {}", self.pid);
        if let Err(e) = self.signal(Signal::Terminate) {
            warn!("{e}");
        }
        if let Ok(exit) = tokio::time::timeout(grace, self.wait()).await {
            return exit;
        }
        warn!(
            "process {} did not exit after SIGTERM (grace period: {grace:?}), sending SIGKILL",
            self.pid
        );
        if let Err(e) = self.signal(Signal::Kill) {
            warn!("{e}");
        }
        self.wait().await
    }
}

/// Merged stdout/stderr lines of a spawned process. Ends once both streams close.
pub struct ProcessOutput {
    rx: mpsc::Receiver<OutputLine>,
}

impl ProcessOutput {
    pub(crate) fn new(rx: mpsc::Receiver<OutputLine>) -> Self {
        Self { rx }
    }

    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }
}

pub struct SpawnedProcess {
    pub output: ProcessOutput,
    pub controller: ProcessController,
}
