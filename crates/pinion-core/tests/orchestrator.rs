//! Lifecycle scenarios driven through the public `Orchestrator` API on the
//! mock process runner and mock tunnel client.

use pinion_core::{CoreError, EventKind, OperationKind, Orchestrator, Outcome};
use pinion_runtime::{MockBehavior, MockRunner, MockTunnelClient};
use pinion_schema::{Catalog, Package, PinionConfig};
use pinion_store::{
    FileStateStore, LifecyclePhase, MemoryStateStore, PackageRecord, StateStore, StoreLayout,
    TunnelInfo,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    dir: TempDir,
    runner: Arc<MockRunner>,
    tunnels: Arc<MockTunnelClient>,
    store: Arc<MemoryStateStore>,
    orch: Orchestrator,
}

fn package(id: &str) -> Package {
    let mut p = Package::new(id, id.to_uppercase());
    p.install = Some(vec!["installer".to_owned()]);
    p.run = Some(vec!["server".to_owned()]);
    p
}

fn harness_with(packages: Vec<Package>, tweak: impl FnOnce(&mut PinionConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PinionConfig::for_testing(dir.path());
    tweak(&mut config);
    let runner = Arc::new(MockRunner::new());
    let tunnels = Arc::new(MockTunnelClient::new().with_delay(Duration::from_millis(50)));
    let store = Arc::new(MemoryStateStore::new());
    let orch = Orchestrator::builder(config)
        .catalog(Catalog::from_packages(packages))
        .store(store.clone())
        .runner(runner.clone())
        .tunnel_client(tunnels.clone())
        .build()
        .unwrap();
    Harness {
        dir,
        runner,
        tunnels,
        store,
        orch,
    }
}

fn harness(ids: &[&str]) -> Harness {
    harness_with(ids.iter().map(|id| package(id)).collect(), |_| {})
}

async fn complete(orch: &Orchestrator, id: &str, kind: OperationKind) -> Outcome {
    let op = orch.submit(id, kind).unwrap();
    orch.await_operation(&op, WAIT).await.unwrap().outcome
}

async fn bring_up(orch: &Orchestrator, id: &str) {
    assert_eq!(
        complete(orch, id, OperationKind::Install).await,
        Outcome::succeeded()
    );
    assert_eq!(
        complete(orch, id, OperationKind::Run).await,
        Outcome::succeeded()
    );
}

async fn wait_for_phase(orch: &Orchestrator, id: &str, phase: LifecyclePhase) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if orch.inspect(id).unwrap().phase == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{id} never reached {phase}, stuck at {}",
        orch.inspect(id).unwrap().phase
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn full_lifecycle_with_tunnel() {
    let h = harness(&["p1"]);
    let mut events = h.orch.subscribe(Some("p1"));

    let install = h.orch.submit("p1", OperationKind::Install).unwrap();
    let report = h.orch.await_operation(&install, WAIT).await.unwrap();
    assert_eq!(report.outcome, Outcome::succeeded());
    assert!(report.finished_at.is_some());

    let snap = h.orch.inspect("p1").unwrap();
    assert_eq!(snap.phase, LifecyclePhase::Installed);
    assert_eq!(snap.install_progress, 100);
    assert!(snap.progress_determinate);
    assert!(snap.pid.is_none());

    let mut percents = Vec::new();
    while let Some(event) = events.try_recv() {
        if let EventKind::Progress { percent, .. } = event.kind {
            percents.push(percent);
        }
    }
    assert_eq!(percents, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);

    assert_eq!(
        complete(&h.orch, "p1", OperationKind::Run).await,
        Outcome::succeeded()
    );
    let snap = h.orch.inspect("p1").unwrap();
    assert_eq!(snap.phase, LifecyclePhase::Running);
    assert!(snap.pid.is_some());

    let outcome = complete(&h.orch, "p1", OperationKind::CreateTunnel).await;
    let Outcome::Succeeded {
        tunnel_url: Some(url),
    } = outcome
    else {
        panic!("expected a tunnel url, got {outcome:?}");
    };
    assert!(url.starts_with("https://p1-"), "{url}");
    assert!(url.ends_with(".example.com"), "{url}");
    assert_eq!(h.orch.inspect("p1").unwrap().tunnel.unwrap().url, url);

    assert_eq!(
        complete(&h.orch, "p1", OperationKind::Stop).await,
        Outcome::succeeded()
    );
    let snap = h.orch.inspect("p1").unwrap();
    assert_eq!(snap.phase, LifecyclePhase::Installed);
    assert!(snap.tunnel.is_none());
    assert!(snap.pid.is_none());
    assert_eq!(h.tunnels.active(), 0);
    assert_eq!(h.runner.live_processes(), 0);

    let persisted = h.store.get("p1").unwrap().unwrap();
    assert_eq!(persisted.phase, LifecyclePhase::Installed);
    assert_eq!(persisted.version, snap.version);
}

#[tokio::test(flavor = "multi_thread")]
async fn state_events_carry_increasing_versions() {
    let h = harness(&["p1"]);
    let mut events = h.orch.subscribe(Some("p1"));
    bring_up(&h.orch, "p1").await;

    let mut transitions = Vec::new();
    let mut last_seq = 0;
    while let Some(event) = events.try_recv() {
        assert!(event.seq > last_seq, "seq went backwards");
        last_seq = event.seq;
        if let EventKind::StateChanged { to, version, .. } = event.kind {
            transitions.push((to, version));
        }
    }
    let phases: Vec<LifecyclePhase> = transitions.iter().map(|(p, _)| *p).collect();
    assert_eq!(
        phases,
        vec![
            LifecyclePhase::Installing,
            LifecyclePhase::Installed,
            LifecyclePhase::Starting,
            LifecyclePhase::Running,
        ]
    );
    assert!(transitions.windows(2).all(|w| w[0].1 < w[1].1));
}

#[tokio::test(flavor = "multi_thread")]
async fn run_while_installing_is_rejected() {
    let h = harness(&["p1"]);
    h.runner
        .script("installer", MockBehavior::serve(["::progress:: 50"]));

    let install = h.orch.submit("p1", OperationKind::Install).unwrap();
    let before = h.orch.inspect("p1").unwrap();
    assert_eq!(before.phase, LifecyclePhase::Installing);

    let err = h.orch.submit("p1", OperationKind::Run).unwrap_err();
    assert!(
        matches!(
            err,
            CoreError::InvalidTransition {
                from: LifecyclePhase::Installing,
                requested: OperationKind::Run,
            }
        ),
        "{err}"
    );
    assert_eq!(h.orch.inspect("p1").unwrap().phase, LifecyclePhase::Installing);

    match h.orch.submit("p1", OperationKind::Install) {
        Err(CoreError::AlreadyInProgress { operation, .. }) => assert_eq!(operation, install),
        other => panic!("expected AlreadyInProgress, got {other:?}"),
    }

    assert!(h.orch.cancel(&install).unwrap());
    h.orch.await_operation(&install, WAIT).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_install_fails_within_grace_period() {
    let h = harness(&["p1"]);
    h.runner
        .script("installer", MockBehavior::serve(["::progress:: 5"]));
    let op = h.orch.submit("p1", OperationKind::Install).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert!(h.orch.cancel(&op).unwrap());
    let report = h.orch.await_operation(&op, WAIT).await.unwrap();
    assert_eq!(report.outcome, Outcome::Cancelled);
    let grace = h.orch.config().grace_period();
    assert!(started.elapsed() < grace + Duration::from_millis(500));

    let snap = h.orch.inspect("p1").unwrap();
    assert_eq!(snap.phase, LifecyclePhase::InstallFailed);
    assert_eq!(snap.last_error.unwrap().kind, "cancelled");
    assert_eq!(h.runner.live_processes(), 0);
    assert!(!h.orch.cancel(&op).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn stubborn_install_is_killed_after_grace() {
    let h = harness(&["p1"]);
    h.runner
        .script("installer", MockBehavior::stubborn(["ignoring SIGTERM"]));
    let op = h.orch.submit("p1", OperationKind::Install).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert!(h.orch.cancel(&op).unwrap());
    let report = h.orch.await_operation(&op, WAIT).await.unwrap();
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert!(started.elapsed() >= h.orch.config().grace_period());
    assert_eq!(h.runner.live_processes(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn fifty_concurrent_installs_follow_their_scripts() {
    let packages: Vec<Package> = (0..50)
        .map(|i| {
            let mut p = package(&format!("pkg{i:02}"));
            if i % 2 == 1 {
                p.install = Some(vec!["bad-install".to_owned()]);
            }
            p
        })
        .collect();
    let h = harness_with(packages, |_| {});
    h.runner.script(
        "bad-install",
        MockBehavior::exit_with_lines(["::progress:: 30", "error: no space left"], 1),
    );

    let ops: Vec<_> = (0..50)
        .map(|i| {
            h.orch
                .submit(&format!("pkg{i:02}"), OperationKind::Install)
                .unwrap()
        })
        .collect();
    for op in &ops {
        let report = h.orch.await_operation(op, WAIT).await.unwrap();
        assert!(report.is_terminal());
    }

    for i in 0..50 {
        let snap = h.orch.inspect(&format!("pkg{i:02}")).unwrap();
        if i % 2 == 0 {
            assert_eq!(snap.phase, LifecyclePhase::Installed, "pkg{i:02}");
            assert_eq!(snap.install_progress, 100);
        } else {
            assert_eq!(snap.phase, LifecyclePhase::InstallFailed, "pkg{i:02}");
            let error = snap.last_error.unwrap();
            assert_eq!(error.kind, "process_crashed");
            assert_eq!(error.exit_code, Some(1));
            assert!(snap.log_tail.iter().any(|l| l.contains("no space left")));
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_install_can_be_retried() {
    let h = harness(&["p1"]);
    h.runner
        .script("installer", MockBehavior::exit_with_lines(["::progress:: 80"], 2));
    let outcome = complete(&h.orch, "p1", OperationKind::Install).await;
    assert!(matches!(outcome, Outcome::Failed { .. }));
    assert_eq!(h.orch.inspect("p1").unwrap().install_progress, 80);

    h.runner.script("installer", MockBehavior::exit(0));
    let mut events = h.orch.subscribe(Some("p1"));
    assert_eq!(
        complete(&h.orch, "p1", OperationKind::Install).await,
        Outcome::succeeded()
    );
    let first_progress = std::iter::from_fn(|| events.try_recv())
        .find_map(|e| match e.kind {
            EventKind::Progress { percent, .. } => Some(percent),
            _ => None,
        });
    assert_eq!(first_progress, Some(0));
    let snap = h.orch.inspect("p1").unwrap();
    assert_eq!(snap.phase, LifecyclePhase::Installed);
    assert!(snap.last_error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn install_crash_keeps_output_tail() {
    let h = harness(&["p1"]);
    h.runner.script(
        "installer",
        MockBehavior::exit_with_lines(["Traceback", "ImportError: no torch"], 2),
    );
    let outcome = complete(&h.orch, "p1", OperationKind::Install).await;
    let Outcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.kind, "process_crashed");
    assert_eq!(error.exit_code, Some(2));
    assert!(error.tail.iter().any(|l| l == "ImportError: no torch"));

    let last = h.orch.inspect("p1").unwrap().last_error.unwrap();
    assert_eq!(last.tail, error.tail);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_tunnel_request_reuses_url() {
    let h = harness(&["p1"]);
    bring_up(&h.orch, "p1").await;

    let first = complete(&h.orch, "p1", OperationKind::CreateTunnel).await;
    let second = complete(&h.orch, "p1", OperationKind::CreateTunnel).await;
    assert_eq!(first, second);
    assert!(matches!(first, Outcome::Succeeded { tunnel_url: Some(_) }));
    assert_eq!(h.tunnels.opened(), 1);
    assert_eq!(h.tunnels.active(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn requests_during_tunnel_setup_are_rejected() {
    let h = harness(&["p1"]);
    bring_up(&h.orch, "p1").await;

    let op = h.orch.submit("p1", OperationKind::CreateTunnel).unwrap();
    for kind in [OperationKind::CreateTunnel, OperationKind::Stop] {
        match h.orch.submit("p1", kind) {
            Err(CoreError::AlreadyInProgress { operation, .. }) => assert_eq!(operation, op),
            other => panic!("expected AlreadyInProgress for {kind}, got {other:?}"),
        }
    }
    h.orch.await_operation(&op, WAIT).await.unwrap();
    assert_eq!(h.tunnels.opened(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn tunnel_failure_keeps_package_running() {
    let h = harness(&["p1"]);
    bring_up(&h.orch, "p1").await;
    h.tunnels.set_fail(true);

    let outcome = complete(&h.orch, "p1", OperationKind::CreateTunnel).await;
    let Outcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.kind, "tunnel_unavailable");

    let snap = h.orch.inspect("p1").unwrap();
    assert_eq!(snap.phase, LifecyclePhase::Running);
    assert!(snap.tunnel.is_none());
    assert!(snap.pid.is_some());

    h.tunnels.set_fail(false);
    let retry = complete(&h.orch, "p1", OperationKind::CreateTunnel).await;
    assert!(matches!(retry, Outcome::Succeeded { tunnel_url: Some(_) }));
}

#[tokio::test(flavor = "multi_thread")]
async fn close_tunnel_is_a_noop_when_absent() {
    let h = harness(&["p1"]);
    assert_eq!(h.orch.inspect("p1").unwrap().phase, LifecyclePhase::NotInstalled);
    assert!(matches!(
        h.orch.submit("p1", OperationKind::CloseTunnel),
        Err(CoreError::InvalidTransition { .. })
    ));

    bring_up(&h.orch, "p1").await;
    assert_eq!(
        complete(&h.orch, "p1", OperationKind::CloseTunnel).await,
        Outcome::succeeded()
    );
    assert_eq!(h.tunnels.opened(), 0);

    complete(&h.orch, "p1", OperationKind::CreateTunnel).await;
    assert_eq!(
        complete(&h.orch, "p1", OperationKind::CloseTunnel).await,
        Outcome::succeeded()
    );
    assert!(h.orch.inspect("p1").unwrap().tunnel.is_none());
    assert_eq!(h.tunnels.active(), 0);
    assert_eq!(h.orch.inspect("p1").unwrap().phase, LifecyclePhase::Running);
}

fn serving_then_crash(lines: usize, code: i32) -> MockBehavior {
    let mut script = vec!["Running on local URL:  http://127.0.0.1:7860".to_owned()];
    script.extend((0..lines).map(|i| format!("GET /queue {i}")));
    script.push("Killed".to_owned());
    MockBehavior::exit_with_lines(script, code)
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_while_running_clears_process_and_tunnel() {
    let h = harness(&["p1"]);
    // About a second of output before the process dies.
    h.runner.script("server", serving_then_crash(500, 137));
    bring_up(&h.orch, "p1").await;
    let outcome = complete(&h.orch, "p1", OperationKind::CreateTunnel).await;
    assert!(matches!(outcome, Outcome::Succeeded { tunnel_url: Some(_) }));

    wait_for_phase(&h.orch, "p1", LifecyclePhase::RunFailed).await;
    let snap = h.orch.inspect("p1").unwrap();
    assert!(snap.pid.is_none());
    assert!(snap.tunnel.is_none());
    assert_eq!(snap.log_tail.last().map(String::as_str), Some("Killed"));
    let error = snap.last_error.unwrap();
    assert_eq!(error.kind, "process_crashed");
    assert_eq!(error.exit_code, Some(137));

    let deadline = Instant::now() + WAIT;
    while h.tunnels.active() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.tunnels.active(), 0);
    assert_eq!(h.runner.live_processes(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_publishes_run_failed_transition() {
    let h = harness(&["p1"]);
    h.runner.script("server", serving_then_crash(3, 139));
    complete(&h.orch, "p1", OperationKind::Install).await;
    let mut events = h.orch.subscribe(Some("p1"));
    assert_eq!(
        complete(&h.orch, "p1", OperationKind::Run).await,
        Outcome::succeeded()
    );
    wait_for_phase(&h.orch, "p1", LifecyclePhase::RunFailed).await;

    let saw_run_failed = std::iter::from_fn(|| events.try_recv()).any(|e| {
        matches!(
            e.kind,
            EventKind::StateChanged {
                from: LifecyclePhase::Running,
                to: LifecyclePhase::RunFailed,
                ..
            }
        )
    });
    assert!(saw_run_failed);

    h.runner.script("server", MockBehavior::serve(["::ready::"]));
    assert_eq!(
        complete(&h.orch, "p1", OperationKind::Run).await,
        Outcome::succeeded()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_before_ready_is_run_failed_and_rerunnable() {
    let mut p = package("p1");
    p.ready_marker = Some("To see the GUI".to_owned());
    let h = harness_with(vec![p], |_| {});
    h.runner.script(
        "server",
        MockBehavior::exit_with_lines(["loading", "ImportError: no module named torch"], 2),
    );
    complete(&h.orch, "p1", OperationKind::Install).await;

    let outcome = complete(&h.orch, "p1", OperationKind::Run).await;
    let Outcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.kind, "process_crashed");
    assert_eq!(error.exit_code, Some(2));

    let snap = h.orch.inspect("p1").unwrap();
    assert_eq!(snap.phase, LifecyclePhase::RunFailed);
    assert!(snap.pid.is_none());
    assert!(snap
        .log_tail
        .iter()
        .any(|l| l.contains("ImportError: no module named torch")));

    h.runner.script(
        "server",
        MockBehavior::serve(["To see the GUI go to: http://127.0.0.1:8188"]),
    );
    assert_eq!(
        complete(&h.orch, "p1", OperationKind::Run).await,
        Outcome::succeeded()
    );
    assert!(h.orch.inspect("p1").unwrap().last_error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn ready_timeout_terminates_the_process() {
    let mut p = package("p1");
    p.ready_marker = Some("never printed".to_owned());
    let h = harness_with(vec![p], |c| c.ready_timeout_ms = 200);
    h.runner.script("server", MockBehavior::serve(["loading"]));
    complete(&h.orch, "p1", OperationKind::Install).await;

    let outcome = complete(&h.orch, "p1", OperationKind::Run).await;
    let Outcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.kind, "timeout");
    assert_eq!(h.orch.inspect("p1").unwrap().phase, LifecyclePhase::RunFailed);
    assert_eq!(h.runner.live_processes(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn quiet_process_is_ready_after_fallback_delay() {
    let h = harness(&["p1"]);
    h.runner.script("server", MockBehavior::serve(["warming up"]));
    complete(&h.orch, "p1", OperationKind::Install).await;
    assert_eq!(
        complete(&h.orch, "p1", OperationKind::Run).await,
        Outcome::succeeded()
    );
    assert_eq!(h.orch.inspect("p1").unwrap().phase, LifecyclePhase::Running);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_run_is_run_failed() {
    let mut p = package("p1");
    p.ready_marker = Some("never printed".to_owned());
    let h = harness_with(vec![p], |_| {});
    h.runner.script("server", MockBehavior::serve(["loading"]));
    complete(&h.orch, "p1", OperationKind::Install).await;

    let op = h.orch.submit("p1", OperationKind::Run).unwrap();
    assert_eq!(h.orch.inspect("p1").unwrap().phase, LifecyclePhase::Starting);
    assert!(h.orch.cancel(&op).unwrap());
    let report = h.orch.await_operation(&op, WAIT).await.unwrap();
    assert_eq!(report.outcome, Outcome::Cancelled);
    let snap = h.orch.inspect("p1").unwrap();
    assert_eq!(snap.phase, LifecyclePhase::RunFailed);
    assert!(snap.pid.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn spawn_failure_is_reported_on_the_operation() {
    let h = harness(&["p1"]);
    h.runner.script(
        "installer",
        MockBehavior::SpawnError("No such file or directory".to_owned()),
    );
    let outcome = complete(&h.orch, "p1", OperationKind::Install).await;
    let Outcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error.kind, "process_spawn_failure");
    assert_eq!(
        h.orch.inspect("p1").unwrap().phase,
        LifecyclePhase::InstallFailed
    );

    h.runner.script("installer", MockBehavior::exit(0));
    complete(&h.orch, "p1", OperationKind::Install).await;
    h.runner
        .script("server", MockBehavior::SpawnError("permission denied".to_owned()));
    let outcome = complete(&h.orch, "p1", OperationKind::Run).await;
    assert!(matches!(outcome, Outcome::Failed { .. }));
    let snap = h.orch.inspect("p1").unwrap();
    assert_eq!(snap.phase, LifecyclePhase::RunFailed);
    assert!(snap.pid.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn unavailable_runner_refuses_install_and_run() {
    let h = harness(&["p1"]);
    h.runner.set_available(false);
    assert!(matches!(
        h.orch.submit("p1", OperationKind::Install),
        Err(CoreError::RunnerUnavailable(_))
    ));
    assert!(!h.orch.status().process_runner);
    assert_eq!(
        h.orch.inspect("p1").unwrap().phase,
        LifecyclePhase::NotInstalled
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_ids_are_rejected() {
    let h = harness(&["p1"]);
    assert!(matches!(
        h.orch.submit("nope", OperationKind::Install),
        Err(CoreError::PackageNotFound(_))
    ));
    assert!(matches!(
        h.orch.submit("../etc", OperationKind::Install),
        Err(CoreError::InvalidId(_))
    ));
    assert!(matches!(
        h.orch.inspect("nope"),
        Err(CoreError::PackageNotFound(_))
    ));
    assert!(matches!(
        h.orch.cancel("no-such-op"),
        Err(CoreError::OperationNotFound(_))
    ));
    assert!(matches!(
        h.orch.operation("no-such-op"),
        Err(CoreError::OperationNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn await_times_out_without_stopping_the_operation() {
    let h = harness(&["p1"]);
    h.runner
        .script("installer", MockBehavior::serve(["::progress:: 1"]));
    let op = h.orch.submit("p1", OperationKind::Install).unwrap();
    let err = h
        .orch
        .await_operation(&op, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout(_)));
    assert!(!h.orch.operation(&op).unwrap().is_terminal());
    assert_eq!(h.orch.inspect("p1").unwrap().phase, LifecyclePhase::Installing);
    h.orch.cancel(&op).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn store_conflicts_are_retried() {
    let h = harness(&["p1"]);
    h.store.inject_conflicts(2);
    assert_eq!(
        complete(&h.orch, "p1", OperationKind::Install).await,
        Outcome::succeeded()
    );
    let persisted = h.store.get("p1").unwrap().unwrap();
    assert_eq!(persisted.phase, LifecyclePhase::Installed);
    assert_eq!(persisted.install_progress, 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn foreign_store_write_is_replaced_by_live_state() {
    let h = harness(&["p1"]);
    complete(&h.orch, "p1", OperationKind::Install).await;

    let mut foreign = h.store.get("p1").unwrap().unwrap();
    let version = foreign.version;
    foreign.phase = LifecyclePhase::NotInstalled;
    foreign.install_progress = 0;
    h.store.put(&foreign, version).unwrap();

    assert_eq!(
        complete(&h.orch, "p1", OperationKind::Run).await,
        Outcome::succeeded()
    );
    let persisted = h.store.get("p1").unwrap().unwrap();
    assert_eq!(persisted.phase, LifecyclePhase::Running);
    assert_eq!(persisted.install_progress, 100);
    assert!(persisted.version > version + 1);
    assert_eq!(h.orch.inspect("p1").unwrap().version, persisted.version);
}

#[tokio::test(flavor = "multi_thread")]
async fn log_tail_is_bounded() {
    let h = harness_with(vec![package("p1")], |c| c.log_tail_lines = 5);
    complete(&h.orch, "p1", OperationKind::Install).await;
    let tail = h.orch.inspect("p1").unwrap().log_tail;
    assert_eq!(tail.len(), 5);
    assert_eq!(tail.last().map(String::as_str), Some("::progress:: 100"));
    assert_eq!(tail.first().map(String::as_str), Some("::progress:: 60"));
}

#[tokio::test(flavor = "multi_thread")]
async fn repository_packages_clone_install_and_detect_entry_script() {
    let mut p = Package::new("p1", "P1");
    p.repo_url = Some("https://example.com/p1.git".to_owned());
    p.port = 7870;
    let h = harness_with(vec![p], |_| {});

    bring_up(&h.orch, "p1").await;
    let spawned = h.runner.spawned();
    let programs: Vec<&str> = spawned.iter().map(|s| s.program.as_str()).collect();
    assert_eq!(programs, vec!["git", "python3", "python3"]);
    assert_eq!(
        spawned[1].args,
        vec!["-m", "pip", "install", "-r", "requirements.txt"]
    );
    assert_eq!(spawned[2].args, vec!["app.py"]);
    assert_eq!(spawned[2].env_var("PORT"), Some("7870"));
    assert!(h.dir.path().join("apps/p1/app.py").is_file());
    assert!(h.orch.status().repository);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_running_packages() {
    let h = harness(&["p1", "p2"]);
    bring_up(&h.orch, "p1").await;
    complete(&h.orch, "p1", OperationKind::CreateTunnel).await;
    complete(&h.orch, "p2", OperationKind::Install).await;

    h.orch.shutdown().await;
    assert_eq!(h.orch.inspect("p1").unwrap().phase, LifecyclePhase::Installed);
    assert_eq!(h.orch.inspect("p2").unwrap().phase, LifecyclePhase::Installed);
    assert_eq!(h.runner.live_processes(), 0);
    assert_eq!(h.tunnels.active(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_waits_out_tunnel_setup_then_stops() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let tunnels = Arc::new(MockTunnelClient::new().with_delay(Duration::from_millis(500)));
    let orch = Orchestrator::builder(PinionConfig::for_testing(dir.path()))
        .catalog(Catalog::from_packages(vec![package("p1")]))
        .store(Arc::new(MemoryStateStore::new()))
        .runner(runner.clone())
        .tunnel_client(tunnels.clone())
        .build()
        .unwrap();
    bring_up(&orch, "p1").await;

    let tunnel_op = orch.submit("p1", OperationKind::CreateTunnel).unwrap();
    orch.shutdown().await;

    let report = orch.operation(&tunnel_op).unwrap();
    assert!(report.is_terminal());
    let snap = orch.inspect("p1").unwrap();
    assert_eq!(snap.phase, LifecyclePhase::Installed);
    assert!(snap.pid.is_none());
    assert!(snap.tunnel.is_none());
    assert_eq!(runner.live_processes(), 0);
    assert_eq!(tunnels.active(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn list_and_status_reflect_state() {
    let h = harness(&["p1", "p2"]);
    let status = h.orch.status();
    assert!(status.environment);
    assert!(status.database);
    assert!(status.process_runner);

    bring_up(&h.orch, "p1").await;
    let list = h.orch.list_packages();
    assert_eq!(list.len(), 2);
    let p1 = list.iter().find(|s| s.id == "p1").unwrap();
    assert!(p1.installed && p1.running);
    assert_eq!(p1.phase, LifecyclePhase::Running);
    let p2 = list.iter().find(|s| s.id == "p2").unwrap();
    assert!(!p2.installed);
    assert_eq!(p2.phase, LifecyclePhase::NotInstalled);
}

fn record(id: &str, phase: LifecyclePhase) -> PackageRecord {
    let mut r = PackageRecord::new(id.into(), 200);
    r.phase = phase;
    r
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_recovers_interrupted_phases() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStateStore::open(StoreLayout::new(dir.path())).unwrap();
        let mut running = record("p1", LifecyclePhase::Running);
        running.tunnel = Some(TunnelInfo {
            url: "https://p1-dead.example.com".to_owned(),
            established_at: "2025-01-01T00:00:00Z".to_owned(),
        });
        store.put(&running, 0).unwrap();
        store.put(&record("p2", LifecyclePhase::Installing), 0).unwrap();
        store.put(&record("p3", LifecyclePhase::RunFailed), 0).unwrap();
    }

    let catalog = Catalog::from_packages(["p1", "p2", "p3"].map(package));
    let orch = Orchestrator::builder(PinionConfig::for_testing(dir.path()))
        .catalog(catalog.clone())
        .runner(Arc::new(MockRunner::new()))
        .tunnel_client(Arc::new(MockTunnelClient::new()))
        .build()
        .unwrap();

    let p1 = orch.inspect("p1").unwrap();
    assert_eq!(p1.phase, LifecyclePhase::Installed);
    assert!(p1.tunnel.is_none());
    let p2 = orch.inspect("p2").unwrap();
    assert_eq!(p2.phase, LifecyclePhase::InstallFailed);
    assert_eq!(p2.last_error.unwrap().kind, "interrupted");
    assert_eq!(orch.inspect("p3").unwrap().phase, LifecyclePhase::RunFailed);

    // The state directory is locked while the first orchestrator lives.
    let second = Orchestrator::builder(PinionConfig::for_testing(dir.path()))
        .catalog(catalog)
        .build();
    assert!(matches!(second, Err(CoreError::Locked(_))));

    // Recovered records are persisted.
    assert_eq!(
        complete(&orch, "p1", OperationKind::Run).await,
        Outcome::succeeded()
    );
}

#[test]
fn blocking_await_from_plain_thread() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::builder(PinionConfig::for_testing(dir.path()))
        .catalog(Catalog::from_packages([package("p1")]))
        .store(Arc::new(MemoryStateStore::new()))
        .runtime(rt.handle().clone())
        .build()
        .unwrap();

    let op = orch.submit("p1", OperationKind::Install).unwrap();
    let report = orch.await_operation_blocking(&op, WAIT).unwrap();
    assert_eq!(report.outcome, Outcome::succeeded());
    assert_eq!(orch.inspect("p1").unwrap().phase, LifecyclePhase::Installed);
}
