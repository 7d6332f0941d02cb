use super::{
    check_prereqs, describe_outcome, error_message, json_pretty, progress_bar, spin_fail, spin_ok,
    truncate, Session, EXIT_FAILURE, EXIT_SUCCESS,
};
use pinion_core::{EventKind, OperationKind, Outcome};
use pinion_schema::PinionConfig;

pub fn run(config: &PinionConfig, id: &str, json: bool) -> Result<u8, String> {
    check_prereqs(config, false)?;
    let session = Session::open(config)?;
    let orch = &session.orch;

    // Subscribe first so no early progress is missed.
    let mut events = orch.subscribe(Some(id));
    let op = orch
        .submit(id, OperationKind::Install)
        .map_err(|e| error_message(&e))?;

    let pb = progress_bar(&format!("installing {id}"), json);
    let report = session.follow(&op, &mut events, |event| match &event.kind {
        EventKind::Progress { percent, .. } => pb.set_position(u64::from(*percent)),
        EventKind::LogLine { line, .. } => pb.set_message(truncate(line, 60)),
        _ => {}
    })?;

    if json {
        println!("{}", json_pretty(&report)?);
    }
    match report.outcome {
        Outcome::Succeeded { .. } => {
            spin_ok(&pb, &format!("installed {id}"));
            Ok(EXIT_SUCCESS)
        }
        _ => {
            spin_fail(&pb, &format!("install of {id} failed"));
            if !json {
                eprintln!("{}", describe_outcome(&report));
                if let Ok(snap) = orch.inspect(id) {
                    for line in snap.log_tail.iter().rev().take(10).rev() {
                        eprintln!("  {line}");
                    }
                }
            }
            Ok(EXIT_FAILURE)
        }
    }
}
