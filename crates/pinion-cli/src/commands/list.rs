use super::{colorize_phase, json_pretty, Session, EXIT_SUCCESS};
use console::{pad_str, Alignment};
use pinion_schema::PinionConfig;

pub fn run(config: &PinionConfig, json: bool) -> Result<u8, String> {
    let session = Session::open(config)?;
    let packages = session.orch.list_packages();
    if json {
        println!("{}", json_pretty(&packages)?);
    } else if packages.is_empty() {
        println!("no packages in {}", config.catalog_path().display());
    } else {
        println!("{:<24} {:<14} {:<12} NAME", "ID", "PHASE", "CATEGORY");
        for p in &packages {
            let phase = colorize_phase(p.phase);
            let phase = pad_str(&phase, 14, Alignment::Left, None);
            let mut name = p.name.clone();
            if let Some(url) = &p.tunnel_url {
                name = format!("{name}  {url}");
            }
            println!("{:<24} {phase} {:<12} {name}", p.id.as_str(), p.category);
        }
    }
    Ok(EXIT_SUCCESS)
}
