//! Install and run recipes derived from catalog metadata.

use crate::CoreError;
use pinion_runtime::{CommandRole, CommandSpec};
use pinion_schema::Package;
use std::path::{Path, PathBuf};

/// Requirement files tried, in order, after a checkout.
pub const REQUIREMENT_FILES: [&str; 3] = ["requirements.txt", "requirements.pip", "deps.txt"];

/// Entry scripts tried, in order, when a package has no explicit run command.
/// `<id>.py` is tried last.
pub const ENTRY_SCRIPTS: [&str; 7] = [
    "app.py",
    "main.py",
    "webui.py",
    "launch.py",
    "run.py",
    "start.py",
    "server.py",
];

/// Lines that count as "the web UI is up" for every package.
pub const READY_MARKERS: [&str; 3] = ["::ready::", "Running on local URL", "Uvicorn running on"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStep {
    Command(CommandSpec),
    /// `pip install -r` on whichever requirement file the checkout ships.
    /// Resolved when the step starts, after the clone has happened.
    Requirements { checkout: PathBuf, label: String },
}

impl InstallStep {
    /// The command to run, or `None` if the step has nothing to do.
    pub fn resolve(&self) -> Option<CommandSpec> {
        match self {
            InstallStep::Command(spec) => Some(spec.clone()),
            InstallStep::Requirements { checkout, label } => {
                let file = REQUIREMENT_FILES
                    .into_iter()
                    .find(|f| checkout.join(f).is_file())?;
                Some(
                    CommandSpec::new("python3", CommandRole::Install)
                        .args(["-m", "pip", "install", "-r", file])
                        .cwd(checkout)
                        .env("PYTHONUNBUFFERED", "1")
                        .label(label.as_str()),
                )
            }
        }
    }
}

pub fn checkout_dir(package: &Package, apps_dir: &Path) -> PathBuf {
    apps_dir.join(package.id.as_str())
}

pub fn install_plan(package: &Package, apps_dir: &Path) -> Result<Vec<InstallStep>, CoreError> {
    let checkout = checkout_dir(package, apps_dir);

    if let Some(argv) = &package.install {
        let spec = CommandSpec::from_argv(argv, CommandRole::Install)
            .ok_or_else(|| CoreError::ProcessSpawnFailure("empty install command".to_owned()))?
            .cwd(apps_dir)
            .env("PINION_APP_DIR", checkout.to_string_lossy())
            .env("PYTHONUNBUFFERED", "1")
            .label(package.id.as_str());
        return Ok(vec![InstallStep::Command(spec)]);
    }

    let Some(repo_url) = &package.repo_url else {
        return Err(CoreError::ProcessSpawnFailure(format!(
            "no install recipe for {}",
            package.id
        )));
    };

    let mut steps = Vec::with_capacity(2);
    if !checkout.is_dir() {
        steps.push(InstallStep::Command(
            CommandSpec::new("git", CommandRole::Install)
                .args([
                    "clone".to_owned(),
                    "--progress".to_owned(),
                    repo_url.clone(),
                    checkout.to_string_lossy().into_owned(),
                ])
                .cwd(apps_dir)
                .label(package.id.as_str()),
        ));
    }
    steps.push(InstallStep::Requirements {
        checkout,
        label: package.id.to_string(),
    });
    Ok(steps)
}

/// The command that starts the package's web UI.
pub fn run_command(package: &Package, apps_dir: &Path) -> Result<CommandSpec, CoreError> {
    let checkout = checkout_dir(package, apps_dir);

    let spec = if let Some(argv) = &package.run {
        let cwd = if checkout.is_dir() {
            checkout
        } else {
            apps_dir.to_path_buf()
        };
        CommandSpec::from_argv(argv, CommandRole::Run)
            .ok_or_else(|| CoreError::ProcessSpawnFailure("empty run command".to_owned()))?
            .cwd(cwd)
    } else {
        let own_script = format!("{}.py", package.id);
        let script = ENTRY_SCRIPTS
            .iter()
            .copied()
            .chain(std::iter::once(own_script.as_str()))
            .find(|s| checkout.join(s).is_file())
            .ok_or_else(|| {
                CoreError::ProcessSpawnFailure(format!(
                    "no entry script found in {}",
                    checkout.display()
                ))
            })?
            .to_owned();
        CommandSpec::new("python3", CommandRole::Run)
            .args([script])
            .cwd(checkout)
    };

    Ok(spec
        .env("PORT", package.port.to_string())
        .env("PYTHONUNBUFFERED", "1")
        .label(package.id.as_str()))
}

/// Whether an output line signals that the package is serving.
pub fn is_ready_line(line: &str, package_marker: Option<&str>) -> bool {
    package_marker.is_some_and(|m| !m.is_empty() && line.contains(m))
        || READY_MARKERS.iter().any(|m| line.contains(m))
}
