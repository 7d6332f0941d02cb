use crate::process::{
    CommandRole, CommandSpec, ExitInfo, OutputLine, OutputStream, ProcessControl,
    ProcessController, ProcessOutput, Signal, SpawnedProcess, OUTPUT_BUFFER,
};
use crate::runner::ProcessRunner;
use crate::RuntimeError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Scripted behaviour of a mock process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Print the lines, then exit with `code`.
    Exit { lines: Vec<String>, code: i32 },
    /// Print the lines, then keep running until signalled.
    Serve {
        lines: Vec<String>,
        ignore_terminate: bool,
    },
    /// Refuse to start.
    SpawnError(String),
}

impl MockBehavior {
    pub fn exit(code: i32) -> Self {
        MockBehavior::Exit {
            lines: Vec::new(),
            code,
        }
    }

    pub fn exit_with_lines<I, S>(lines: I, code: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockBehavior::Exit {
            lines: lines.into_iter().map(Into::into).collect(),
            code,
        }
    }

    pub fn serve<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockBehavior::Serve {
            lines: lines.into_iter().map(Into::into).collect(),
            ignore_terminate: false,
        }
    }

    /// Keeps running through SIGTERM; only SIGKILL ends it.
    pub fn stubborn<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockBehavior::Serve {
            lines: lines.into_iter().map(Into::into).collect(),
            ignore_terminate: true,
        }
    }

    fn default_for(spec: &CommandSpec, serial: u32) -> Self {
        match spec.role {
            CommandRole::Install => {
                Self::exit_with_lines((1..=10).map(|i| format!("::progress:: {}", i * 10)), 0)
            }
            CommandRole::Run => {
                let port = spec.env_var("PORT").unwrap_or("7860");
                Self::serve([
                    format!("starting {}", spec.label),
                    format!("Running on local URL:  http://127.0.0.1:{port}"),
                ])
            }
            CommandRole::Tunnel => Self::serve([
                "INF Requesting new quick Tunnel on trycloudflare.com...".to_owned(),
                format!("INF |  https://mock-{serial:04x}.trycloudflare.com  |"),
            ]),
        }
    }
}

/// In-process [`ProcessRunner`] driven by scripts, for tests and dry runs.
///
/// Behaviours are looked up by program name; unscripted programs get a
/// default per [`CommandRole`]: installs report progress 10..100 and exit 0,
/// runs print a readiness line and serve until signalled.
pub struct MockRunner {
    scripts: Mutex<HashMap<String, MockBehavior>>,
    spawned: Mutex<Vec<CommandSpec>>,
    live: Arc<AtomicUsize>,
    next_pid: AtomicU32,
    line_delay: Duration,
    available: AtomicBool,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            spawned: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
            next_pid: AtomicU32::new(100_000),
            line_delay: Duration::from_millis(2),
            available: AtomicBool::new(true),
        }
    }
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before each scripted line.
    #[must_use]
    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }

    pub fn script(&self, program: impl Into<String>, behavior: MockBehavior) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(program.into(), behavior);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every command spawned so far, in order.
    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mock processes that have not exited yet.
    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, spec: &CommandSpec, serial: u32) -> MockBehavior {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&spec.program)
            .cloned()
            .unwrap_or_else(|| MockBehavior::default_for(spec, serial))
    }
}

impl ProcessRunner for MockRunner {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<SpawnedProcess, RuntimeError> {
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior_for(spec, pid);
        if let MockBehavior::SpawnError(reason) = behavior {
            return Err(RuntimeError::SpawnFailed {
                program: spec.program.clone(),
                reason,
            });
        }
        if spec.program == "git" && spec.args.first().map(String::as_str) == Some("clone") {
            if let Some(dest) = spec.args.last() {
                materialize_checkout(Path::new(dest)).map_err(|e| RuntimeError::SpawnFailed {
                    program: spec.program.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (sig_tx, sig_rx) = mpsc::unbounded_channel();
        self.live.fetch_add(1, Ordering::SeqCst);
        let live = Arc::clone(&self.live);
        let delay = self.line_delay;
        tokio::spawn(async move {
            let exit = run_script(behavior, tx, sig_rx, delay).await;
            live.fetch_sub(1, Ordering::SeqCst);
            exit_tx.send_replace(Some(exit));
        });

        Ok(SpawnedProcess {
            output: ProcessOutput::new(rx),
            controller: ProcessController::new(pid, Arc::new(MockControl { tx: sig_tx }), exit_rx),
        })
    }
}

/// A cloned checkout as the default install recipe expects to find it.
fn materialize_checkout(dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    std::fs::write(dest.join("app.py"), "print('::ready::')\n")?;
    std::fs::write(dest.join("requirements.txt"), "gradio\n")?;
    Ok(())
}

struct MockControl {
    tx: mpsc::UnboundedSender<Signal>,
}

impl ProcessControl for MockControl {
    fn signal(&self, signal: Signal) -> Result<(), RuntimeError> {
        // A closed channel means the script already finished.
        let _ = self.tx.send(signal);
        Ok(())
    }
}

async fn next_signal(rx: &mut mpsc::UnboundedReceiver<Signal>) -> Signal {
    match rx.recv().await {
        Some(signal) => signal,
        None => std::future::pending().await,
    }
}

fn on_signal(signal: Signal, ignore_terminate: bool) -> Option<ExitInfo> {
    match signal {
        Signal::Kill => Some(ExitInfo::signaled(libc::SIGKILL)),
        Signal::Terminate if !ignore_terminate => Some(ExitInfo::signaled(libc::SIGTERM)),
        Signal::Terminate => None,
    }
}

async fn run_script(
    behavior: MockBehavior,
    tx: mpsc::Sender<OutputLine>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    delay: Duration,
) -> ExitInfo {
    let (lines, code, ignore_terminate) = match behavior {
        MockBehavior::Exit { lines, code } => (lines, Some(code), false),
        MockBehavior::Serve {
            lines,
            ignore_terminate,
        } => (lines, None, ignore_terminate),
        MockBehavior::SpawnError(_) => return ExitInfo::UNKNOWN,
    };

    for line in lines {
        tokio::select! {
            biased;
            signal = next_signal(&mut signals) => {
                if let Some(exit) = on_signal(signal, ignore_terminate) {
                    return exit;
                }
            }
            () = tokio::time::sleep(delay) => {}
        }
        let _ = tx
            .send(OutputLine {
                stream: OutputStream::Stdout,
                line,
            })
            .await;
    }

    if let Some(code) = code {
        return ExitInfo::exited(code);
    }
    loop {
        if let Some(exit) = on_signal(next_signal(&mut signals).await, ignore_terminate) {
            return exit;
        }
    }
}
