pub mod completions;
pub mod doctor;
pub mod inspect;
pub mod install;
pub mod list;
pub mod logs;
pub mod run;
pub mod status;

use indicatif::{ProgressBar, ProgressStyle};
use pinion_core::{
    shutdown_requested, CoreError, Event, OperationReport, Orchestrator, Outcome, Subscription,
};
use pinion_schema::{Catalog, OperationId, PinionConfig};
use pinion_store::LifecyclePhase;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::warn;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// How often foreground loops look at the Ctrl-C flag.
const TICK: Duration = Duration::from_millis(200);

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

pub fn spinner(msg: &str, json: bool) -> ProgressBar {
    if json {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        style("{spinner:.cyan} {msg}")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// A 0..100 bar for installs. Starts as a spinner until the first
/// determinate progress value arrives.
pub fn progress_bar(msg: &str, json: bool) -> ProgressBar {
    if json {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    pb.set_style(style("{spinner:.cyan} [{bar:30.cyan/blue}] {pos:>3}% {msg}"));
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_phase(phase: LifecyclePhase) -> String {
    use console::Style;
    let text = phase.to_string();
    match phase {
        LifecyclePhase::Installed => Style::new().green().apply_to(text).to_string(),
        LifecyclePhase::Running => Style::new().cyan().bold().apply_to(text).to_string(),
        LifecyclePhase::Installing | LifecyclePhase::Starting | LifecyclePhase::Stopping => {
            Style::new().yellow().apply_to(text).to_string()
        }
        LifecyclePhase::InstallFailed | LifecyclePhase::RunFailed => {
            Style::new().red().apply_to(text).to_string()
        }
        LifecyclePhase::NotInstalled => Style::new().dim().apply_to(text).to_string(),
    }
}

/// Keep one line of process output short enough for a progress message.
pub fn truncate(line: &str, max: usize) -> String {
    if line.chars().count() <= max {
        return line.to_owned();
    }
    let mut out: String = line.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Error text whose prefix selects the exit code in `main`.
pub fn error_message(e: &CoreError) -> String {
    match e {
        CoreError::Locked(_) => format!("store lock: {e}"),
        _ => e.to_string(),
    }
}

pub fn describe_outcome(report: &OperationReport) -> String {
    match &report.outcome {
        Outcome::Succeeded { .. } => "succeeded".to_owned(),
        Outcome::Failed { error } => match error.exit_code {
            Some(code) => format!("{} (exit code {code})", error.message),
            None => error.message.clone(),
        },
        Outcome::Cancelled => "cancelled".to_owned(),
        Outcome::Pending => "still running".to_owned(),
    }
}

/// `PINION_SKIP_PREREQS=1` bypasses the host tool check.
pub fn check_prereqs(config: &PinionConfig, tunnel: bool) -> Result<(), String> {
    if std::env::var("PINION_SKIP_PREREQS").as_deref() == Ok("1") {
        return Ok(());
    }
    let mut missing = Vec::new();
    if config.runner == "host" {
        missing.extend(pinion_runtime::check_host_prereqs());
    }
    if tunnel && config.tunnel_provider == "cloudflared" {
        missing.extend(pinion_runtime::check_tunnel_prereqs(&config.cloudflared_bin));
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(pinion_runtime::format_missing(&missing))
    }
}

/// An orchestrator and the runtime driving it, for one CLI invocation.
pub struct Session {
    pub orch: Orchestrator,
    pub runtime: Runtime,
}

impl Session {
    pub fn open(config: &PinionConfig) -> Result<Self, String> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| format!("cannot start async runtime: {e}"))?;

        let mut builder = Orchestrator::builder(config.clone()).runtime(runtime.handle().clone());
        // An explicitly configured catalog must load; the default location may be absent.
        if config.catalog_path.is_some() {
            let catalog = Catalog::load(&config.catalog_path())
                .map_err(|e| format!("catalog error: {e}"))?;
            for w in catalog.warnings() {
                warn!("catalog: {w}");
            }
            builder = builder.catalog(catalog);
        }
        let orch = builder.build().map_err(|e| error_message(&e))?;
        Ok(Self { orch, runtime })
    }

    /// Feed bus events to `on_event` until the operation finishes. The
    /// first Ctrl-C cancels it.
    pub fn follow(
        &self,
        op: &OperationId,
        events: &mut Subscription,
        mut on_event: impl FnMut(&Event),
    ) -> Result<OperationReport, String> {
        let orch = &self.orch;
        self.runtime.block_on(async {
            let mut cancel_sent = false;
            loop {
                let report = orch.operation(op).map_err(|e| error_message(&e))?;
                if report.is_terminal() {
                    return Ok(report);
                }
                if let Ok(Some(event)) = tokio::time::timeout(TICK, events.recv()).await {
                    on_event(&event);
                }
                if shutdown_requested() && !cancel_sent {
                    cancel_sent = true;
                    if orch.cancel(op).unwrap_or(false) {
                        eprintln!("cancelling {op}...");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"phase": "installed"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"phase\""));
        assert!(result.contains("\"installed\""));
    }

    #[test]
    fn colorize_phase_keeps_text() {
        for phase in LifecyclePhase::ALL {
            assert!(colorize_phase(phase).contains(&phase.to_string()));
        }
    }

    #[test]
    fn truncate_long_lines() {
        assert_eq!(truncate("short", 10), "short");
        let long = truncate("Downloading torch-2.3.0-cp311-manylinux.whl", 12);
        assert_eq!(long.chars().count(), 12);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn lock_errors_map_to_store_prefix() {
        let msg = error_message(&CoreError::Locked("/tmp/x/store/.lock".to_owned()));
        assert!(msg.starts_with("store lock:"));
        let msg = error_message(&CoreError::PackageNotFound("x".to_owned()));
        assert!(!msg.starts_with("store"));
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_CONFIG_ERROR);
        assert_ne!(EXIT_CONFIG_ERROR, EXIT_STORE_ERROR);
    }

    #[test]
    fn hidden_bars_in_json_mode() {
        assert!(spinner("x", true).is_hidden());
        let pb = spinner("testing...", false);
        spin_ok(&pb, "done");
        let pb = progress_bar("installing", false);
        spin_fail(&pb, "failed");
    }
}
