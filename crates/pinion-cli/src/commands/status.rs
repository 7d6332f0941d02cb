use super::{json_pretty, Session, EXIT_FAILURE, EXIT_SUCCESS};
use pinion_schema::PinionConfig;
use pinion_store::LifecyclePhase;

fn mark(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "unavailable"
    }
}

pub fn run(config: &PinionConfig, json: bool) -> Result<u8, String> {
    let session = Session::open(config)?;
    let orch = &session.orch;
    let status = orch.status();
    let packages = orch.list_packages();
    let installed = packages.iter().filter(|p| p.phase.is_installed()).count();
    let running = packages
        .iter()
        .filter(|p| p.phase == LifecyclePhase::Running)
        .count();

    if json {
        let out = serde_json::json!({
            "status": status,
            "runner": orch.runner_name(),
            "tunnelProvider": orch.tunnel_provider(),
            "stateDir": config.state_dir,
            "packages": packages.len(),
            "installed": installed,
            "running": running,
        });
        println!("{}", json_pretty(&out)?);
    } else {
        println!("environment:    {}", mark(status.environment));
        println!("repository:     {}", mark(status.repository));
        println!("database:       {}", mark(status.database));
        println!(
            "process runner: {} ({})",
            mark(status.process_runner),
            orch.runner_name()
        );
        println!("tunnels:        {}", orch.tunnel_provider());
        println!("state dir:      {}", config.state_dir.display());
        println!(
            "packages:       {} ({installed} installed, {running} running)",
            packages.len()
        );
    }

    Ok(if status.environment && status.process_runner {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
