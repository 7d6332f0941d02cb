use super::{colorize_phase, error_message, json_pretty, Session, EXIT_SUCCESS};
use pinion_schema::PinionConfig;

pub fn run(config: &PinionConfig, id: &str, json: bool) -> Result<u8, String> {
    let session = Session::open(config)?;
    let snap = session.orch.inspect(id).map_err(|e| error_message(&e))?;

    if json {
        println!("{}", json_pretty(&snap)?);
        return Ok(EXIT_SUCCESS);
    }

    let pkg = &snap.package;
    println!("id:        {}", pkg.id);
    println!("name:      {}", pkg.name);
    if !pkg.description.is_empty() {
        println!("about:     {}", pkg.description);
    }
    println!("phase:     {}", colorize_phase(snap.phase));
    if snap.phase.is_installed() || snap.install_progress > 0 {
        let kind = if snap.progress_determinate {
            ""
        } else {
            " (estimated)"
        };
        println!("progress:  {}%{kind}", snap.install_progress);
    }
    println!("port:      {}", pkg.port);
    if let Some(pid) = snap.pid {
        println!("pid:       {pid}");
    }
    if let Some(tunnel) = &snap.tunnel {
        println!("tunnel:    {} (since {})", tunnel.url, tunnel.established_at);
    }
    if let Some(op) = &snap.active_operation {
        println!("operation: {op}");
    }
    if let Some(err) = &snap.last_error {
        println!("error:     [{}] {}", err.kind, err.message);
    }
    println!("version:   {}", snap.version);
    println!("updated:   {}", snap.updated_at);
    if !snap.log_tail.is_empty() {
        println!("\nlast output:");
        for line in snap.log_tail.iter().rev().take(10).rev() {
            println!("  {line}");
        }
    }
    Ok(EXIT_SUCCESS)
}
