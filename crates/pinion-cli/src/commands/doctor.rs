use super::{json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use pinion_core::StoreLock;
use pinion_schema::{Catalog, CatalogError, PinionConfig};
use pinion_store::{FileStateStore, LifecyclePhase, StateStore, StoreLayout};
use std::path::Path;

pub fn run(config: &PinionConfig, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_runner(config, &mut checks, &mut all_pass);
    check_tunnel(config, &mut checks);
    check_config(config, &mut checks, &mut all_pass);
    check_catalog(config, &mut checks, &mut all_pass);

    let layout = StoreLayout::new(&config.state_dir);
    if layout.store_dir().exists() {
        checks.push(Check::pass("state_exists", "State directory exists"));
        check_state(&layout, &mut checks, &mut all_pass);
        check_disk_space(&config.state_dir, &mut checks);
    } else {
        checks.push(Check::info(
            "state_exists",
            "State not initialized (will be created on first use)",
        ));
    }

    print_results(&checks, all_pass, json_output)
}

fn check_runner(config: &PinionConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    if config.runner != "host" {
        checks.push(Check::info(
            "runner_prereqs",
            &format!("Runner '{}' needs no host tools", config.runner),
        ));
        return;
    }
    let missing = pinion_runtime::check_host_prereqs();
    if missing.is_empty() {
        checks.push(Check::pass("runner_prereqs", "Host tools available"));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "runner_prereqs",
            &pinion_runtime::format_missing(&missing),
        ));
    }
}

/// A missing tunnel binary only disables sharing, so it is a warning.
fn check_tunnel(config: &PinionConfig, checks: &mut Vec<Check>) {
    if config.tunnel_provider != "cloudflared" {
        checks.push(Check::info(
            "tunnel_prereqs",
            &format!("Tunnel provider '{}'", config.tunnel_provider),
        ));
        return;
    }
    let missing = pinion_runtime::check_tunnel_prereqs(&config.cloudflared_bin);
    if missing.is_empty() {
        checks.push(Check::pass("tunnel_prereqs", "cloudflared available"));
    } else {
        checks.push(Check::warn(
            "tunnel_prereqs",
            &format!(
                "Public tunnels unavailable: {}",
                pinion_runtime::format_missing(&missing)
            ),
        ));
    }
}

fn check_config(config: &PinionConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match config.validate() {
        Ok(()) => checks.push(Check::pass("config", "Configuration valid")),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("config", &e.to_string()));
        }
    }
}

fn check_catalog(config: &PinionConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let path = config.catalog_path();
    match Catalog::load(&path) {
        Ok(catalog) => {
            checks.push(Check::pass(
                "catalog",
                &format!("Catalog: {} packages", catalog.len()),
            ));
            for w in catalog.warnings() {
                checks.push(Check::warn("catalog_entry", w));
            }
        }
        Err(CatalogError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            checks.push(Check::warn(
                "catalog",
                &format!("No catalog at {}", path.display()),
            ));
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("catalog", &format!("Catalog unreadable: {e}")));
        }
    }
}

fn check_state(layout: &StoreLayout, checks: &mut Vec<Check>, all_pass: &mut bool) {
    if let Err(e) = layout.verify_version() {
        *all_pass = false;
        checks.push(Check::fail(
            "state_version",
            &format!("State format check failed: {e}"),
        ));
        return;
    }
    checks.push(Check::pass("state_version", "State format version valid"));

    let store = match FileStateStore::open(layout.clone()) {
        Ok(s) => s,
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "state_integrity",
                &format!("Cannot open state: {e}"),
            ));
            return;
        }
    };

    match store.verify() {
        Ok(failed) if failed.is_empty() => {
            checks.push(Check::pass("state_integrity", "Package records intact"));
        }
        Ok(failed) => {
            *all_pass = false;
            let keys: Vec<&str> = failed.iter().map(|(k, _)| k.as_str()).collect();
            checks.push(Check::fail(
                "state_integrity",
                &format!("{} corrupted record(s): {}", failed.len(), keys.join(", ")),
            ));
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "state_integrity",
                &format!("Integrity check failed: {e}"),
            ));
        }
    }

    match StoreLock::try_acquire(&layout.lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("state_lock", "State lock is free")),
        Ok(None) => checks.push(Check::warn(
            "state_lock",
            "State is in use by another pinion process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "state_lock",
                &format!("Cannot check state lock: {e}"),
            ));
        }
    }

    match store.list() {
        Ok(records) => {
            let installed = records.iter().filter(|r| r.phase.is_installed()).count();
            let failed = records
                .iter()
                .filter(|r| {
                    matches!(
                        r.phase,
                        LifecyclePhase::InstallFailed | LifecyclePhase::RunFailed
                    )
                })
                .count();
            checks.push(Check::info(
                "packages",
                &format!(
                    "{} package records ({installed} installed, {failed} failed)",
                    records.len()
                ),
            ));
        }
        Err(e) => checks.push(Check::warn(
            "packages",
            &format!("Cannot list package records: {e}"),
        )),
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("Pinion Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

fn check_disk_space(state_dir: &Path, checks: &mut Vec<Check>) {
    let Ok(c_path) = std::ffi::CString::new(state_dir.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: an all-zero statvfs is a valid value for the out parameter.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: the path is NUL-terminated and `stat` is only read on success.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    #[allow(clippy::unnecessary_cast)]
    let avail_mb = (stat.f_bavail as u64 * stat.f_frsize as u64) / (1024 * 1024);

    // Model checkpoints run to several gigabytes.
    if avail_mb < 1024 {
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space: {avail_mb} MB available"),
        ));
    } else if avail_mb < 10 * 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Disk space: {} GB available", avail_mb / 1024),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {} GB available", avail_mb / 1024),
        ));
    }
}
