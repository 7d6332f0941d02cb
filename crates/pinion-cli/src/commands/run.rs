use super::{
    check_prereqs, describe_outcome, error_message, spin_fail, spinner, truncate, Session,
    EXIT_FAILURE, EXIT_SUCCESS,
};
use pinion_core::{shutdown_requested, EventKind, OperationKind, Outcome};
use pinion_schema::PinionConfig;
use pinion_store::LifecyclePhase;
use std::time::Duration;

const TICK: Duration = Duration::from_millis(200);

/// Why the foreground loop ended.
enum Exit {
    Interrupted,
    Crashed,
}

pub fn run(config: &PinionConfig, id: &str, tunnel: bool, json: bool) -> Result<u8, String> {
    check_prereqs(config, tunnel)?;
    let session = Session::open(config)?;
    let orch = &session.orch;

    let mut events = orch.subscribe(Some(id));
    let op = orch
        .submit(id, OperationKind::Run)
        .map_err(|e| error_message(&e))?;
    let pb = spinner(&format!("starting {id}"), json);
    let report = session.follow(&op, &mut events, |event| {
        if let EventKind::LogLine { line, .. } = &event.kind {
            pb.set_message(truncate(line, 60));
        }
    })?;
    if !matches!(report.outcome, Outcome::Succeeded { .. }) {
        spin_fail(&pb, &format!("{id} failed to start"));
        eprintln!("{}", describe_outcome(&report));
        return Ok(EXIT_FAILURE);
    }
    pb.finish_and_clear();

    let snap = orch.inspect(id).map_err(|e| error_message(&e))?;
    let local_url = format!("http://127.0.0.1:{}", snap.package.port);
    let tunnel_url = if tunnel {
        open_tunnel(&session, id, json)
    } else {
        None
    };

    if json {
        let line = serde_json::json!({
            "id": id,
            "phase": LifecyclePhase::Running,
            "localUrl": local_url,
            "tunnelUrl": tunnel_url,
        });
        println!("{line}");
    } else {
        println!("{id} is running at {local_url}");
        if let Some(url) = &tunnel_url {
            println!("public url: {url}");
        }
        println!("press Ctrl-C to stop");
    }

    let exit = session.runtime.block_on(async {
        loop {
            if shutdown_requested() {
                return Exit::Interrupted;
            }
            match tokio::time::timeout(TICK, events.recv()).await {
                Ok(Some(event)) => match event.kind {
                    EventKind::LogLine { line, .. } if !json => println!("{line}"),
                    EventKind::StateChanged {
                        to: LifecyclePhase::RunFailed,
                        ..
                    } => return Exit::Crashed,
                    _ => {}
                },
                Ok(None) => return Exit::Crashed,
                Err(_) => {}
            }
        }
    });

    match exit {
        Exit::Crashed => {
            let reason = orch
                .inspect(id)
                .ok()
                .and_then(|s| s.last_error)
                .map_or_else(|| "process exited".to_owned(), |e| e.message);
            eprintln!("{id} stopped unexpectedly: {reason}");
            session.runtime.block_on(orch.shutdown());
            Ok(EXIT_FAILURE)
        }
        Exit::Interrupted => {
            eprintln!("stopping {id}...");
            session.runtime.block_on(orch.shutdown());
            println!("stopped {id}");
            Ok(EXIT_SUCCESS)
        }
    }
}

/// Request a tunnel and wait for it. A failed tunnel leaves the package
/// running.
fn open_tunnel(session: &Session, id: &str, json: bool) -> Option<String> {
    let orch = &session.orch;
    let op = match orch.submit(id, OperationKind::CreateTunnel) {
        Ok(op) => op,
        Err(e) => {
            eprintln!("warning: cannot open tunnel: {}", error_message(&e));
            return None;
        }
    };
    let pb = spinner("opening tunnel", json);
    let wait = orch.config().tunnel_timeout() + Duration::from_secs(5);
    let result = session.runtime.block_on(orch.await_operation(&op, wait));
    pb.finish_and_clear();
    match result {
        Ok(report) => match report.tunnel_url() {
            Some(url) => Some(url.to_owned()),
            None => {
                eprintln!("warning: tunnel not opened: {}", describe_outcome(&report));
                None
            }
        },
        Err(e) => {
            eprintln!("warning: tunnel not opened: {}", error_message(&e));
            None
        }
    }
}
