use super::{error_message, json_pretty, Session, EXIT_SUCCESS};
use pinion_schema::PinionConfig;

pub fn run(config: &PinionConfig, id: &str, lines: usize, json: bool) -> Result<u8, String> {
    let session = Session::open(config)?;
    let snap = session.orch.inspect(id).map_err(|e| error_message(&e))?;
    let skip = snap.log_tail.len().saturating_sub(lines);
    let tail = &snap.log_tail[skip..];

    if json {
        println!("{}", json_pretty(&tail)?);
    } else {
        for line in tail {
            println!("{line}");
        }
    }
    Ok(EXIT_SUCCESS)
}
