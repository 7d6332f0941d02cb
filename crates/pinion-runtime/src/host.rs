use crate::process::{
    CommandSpec, ExitInfo, OutputLine, OutputStream, ProcessControl, ProcessController,
    ProcessOutput, Signal, SpawnedProcess, OUTPUT_BUFFER,
};
use crate::runner::ProcessRunner;
use crate::RuntimeError;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Runs commands as real child processes, each leading its own process group
/// so that signals reach interpreter children (pip, uvicorn workers) too.
#[derive(Debug, Default)]
pub struct HostRunner;

impl HostRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessRunner for HostRunner {
    fn name(&self) -> &'static str {
        "host"
    }

    fn available(&self) -> bool {
        crate::prereq::command_exists("sh")
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<SpawnedProcess, RuntimeError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .process_group(0);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let spawn_failed = |reason: String| RuntimeError::SpawnFailed {
            program: spec.program.clone(),
            reason,
        };
        let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_failed("process exited before its pid was read".to_owned()))?;
        debug!("[{}] spawned pid {pid}: {}", spec.label, spec.display());

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx.clone()));
        }
        drop(tx);

        let (exit_tx, exit_rx) = watch::channel(None);
        let label = spec.label.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    warn!("[{label}] failed to wait for pid {pid}: {e}");
                    ExitInfo::UNKNOWN
                }
            };
            debug!("[{label}] pid {pid} finished: {exit}");
            exit_tx.send_replace(Some(exit));
        });

        Ok(SpawnedProcess {
            output: ProcessOutput::new(rx),
            controller: ProcessController::new(pid, Arc::new(HostControl { pid }), exit_rx),
        })
    }
}

/// Lossy line reader: invalid UTF-8 never stops the stream, which would
/// otherwise leave the child blocked on a full pipe.
async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_owned();
                if tx.send(OutputLine { stream, line }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("{stream} read error: {e}");
                break;
            }
        }
    }
}

struct HostControl {
    pid: u32,
}

impl ProcessControl for HostControl {
    fn signal(&self, signal: Signal) -> Result<(), RuntimeError> {
        let pid = i32::try_from(self.pid).map_err(|_| RuntimeError::SignalFailed {
            pid: self.pid,
            reason: "pid exceeds i32 range".to_owned(),
        })?;
        let sig = signal.as_raw();

        // The child leads its own group; signal the group first.
        // SAFETY: kill() with a validated pid and a constant signal number is safe.
        #[allow(unsafe_code)]
        let group_ret = unsafe { libc::kill(-pid, sig) };
        if group_ret == 0 {
            return Ok(());
        }

        // SAFETY: same as above.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, sig) };
        if ret != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::ESRCH) {
                debug!("pid {pid} already exited before {signal:?}");
                return Ok(());
            }
            return Err(RuntimeError::SignalFailed {
                pid: self.pid,
                reason: errno.to_string(),
            });
        }
        Ok(())
    }
}
