//! The single owner of per-package lifecycle state.
//!
//! Every package has a slot guarded by its own mutex. Request validation,
//! phase changes, persistence, and event publication for a package all
//! happen under that lock, so they are strictly ordered per package while
//! different packages proceed in parallel. The lock is never held across an
//! `.await`; supervising tasks do their slow work unlocked and re-enter the
//! slot to apply results.

use crate::concurrency::StoreLock;
use crate::events::{EventBus, EventKind, Subscription};
use crate::lifecycle::{plan_transition, validate_transition, OperationKind};
use crate::operation::{CancelToken, OperationEntry, OperationReport, Outcome};
use crate::plan;
use crate::progress::{self, ProgressTracker};
use crate::tunnel::TunnelManager;
use crate::CoreError;
use pinion_runtime::{
    select_runner, select_tunnel_client, ExitInfo, OutputLine, ProcessController, ProcessOutput,
    ProcessRunner, SpawnedProcess, TunnelClient,
};
use pinion_schema::{validate_package_id, Catalog, OperationId, Package, PackageId, PinionConfig};
use pinion_store::{
    FailureInfo, FileStateStore, LifecyclePhase, PackageRecord, StateStore, StoreError,
    StoreLayout, TunnelInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Finished operations kept for `operation()` lookups.
const OPERATION_HISTORY: usize = 1024;
/// Log lines attached to a crash report.
const CRASH_TAIL: usize = 20;
/// How long to keep reading output after a process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One row of the package list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSummary {
    pub id: PackageId,
    pub name: String,
    pub description: String,
    pub category: String,
    pub tags: BTreeSet<String>,
    pub resource_hint: Option<String>,
    pub installed: bool,
    pub running: bool,
    pub phase: LifecyclePhase,
    pub install_progress: u8,
    pub tunnel_url: Option<String>,
}

/// Everything known about one package, read under its lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSnapshot {
    pub package: Package,
    pub phase: LifecyclePhase,
    pub install_progress: u8,
    pub progress_determinate: bool,
    pub tunnel: Option<TunnelInfo>,
    pub log_tail: Vec<String>,
    pub last_error: Option<FailureInfo>,
    pub version: u64,
    pub updated_at: String,
    pub pid: Option<u32>,
    pub active_operation: Option<OperationId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    /// The orchestrator is up.
    pub environment: bool,
    /// The apps directory exists.
    pub repository: bool,
    /// The catalog has at least one package.
    pub database: bool,
    pub process_runner: bool,
}

struct ActiveOperation {
    id: OperationId,
    kind: OperationKind,
}

struct Slot {
    record: PackageRecord,
    process: Option<ProcessController>,
    active: Option<ActiveOperation>,
    /// Bumped for every install or run attempt; supervising tasks compare it
    /// to tell whether the state they are about to change is still theirs.
    attempt: u64,
}

type SlotRef = Arc<Mutex<Slot>>;

enum Interrupted {
    Cancelled,
    Failed(CoreError),
}

impl From<CoreError> for Interrupted {
    fn from(e: CoreError) -> Self {
        Interrupted::Failed(e)
    }
}

#[derive(Default)]
struct OperationTable {
    entries: HashMap<OperationId, Arc<OperationEntry>>,
    order: VecDeque<OperationId>,
}

struct Inner {
    config: PinionConfig,
    catalog: RwLock<Catalog>,
    store: Arc<dyn StateStore>,
    runner: Arc<dyn ProcessRunner>,
    tunnels: TunnelManager,
    bus: EventBus,
    slots: Mutex<HashMap<PackageId, SlotRef>>,
    operations: Mutex<OperationTable>,
    handle: Handle,
    _lock: Option<StoreLock>,
}

/// Assembles an [`Orchestrator`]. Anything not supplied is built from the
/// configuration.
pub struct OrchestratorBuilder {
    config: PinionConfig,
    catalog: Option<Catalog>,
    store: Option<Arc<dyn StateStore>>,
    runner: Option<Arc<dyn ProcessRunner>>,
    tunnel_client: Option<Arc<dyn TunnelClient>>,
    handle: Option<Handle>,
}

impl OrchestratorBuilder {
    pub fn new(config: PinionConfig) -> Self {
        Self {
            config,
            catalog: None,
            store: None,
            runner: None,
            tunnel_client: None,
            handle: None,
        }
    }

    #[must_use]
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    #[must_use]
    pub fn tunnel_client(mut self, client: Arc<dyn TunnelClient>) -> Self {
        self.tunnel_client = Some(client);
        self
    }

    /// Runtime that drives supervising tasks. Defaults to the current one.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<Orchestrator, CoreError> {
        let config = self.config;
        config.validate()?;
        let handle = match self.handle {
            Some(h) => h,
            None => Handle::try_current().map_err(|_| CoreError::NoRuntime)?,
        };

        let catalog = self
            .catalog
            .unwrap_or_else(|| Catalog::load_or_empty(&config.catalog_path()));

        let (store, store_lock): (Arc<dyn StateStore>, Option<StoreLock>) = match self.store {
            Some(store) => (store, None),
            None => {
                let layout = StoreLayout::new(&config.state_dir);
                let lock = StoreLock::acquire_or_fail(&layout.lock_file())?;
                (Arc::new(FileStateStore::open(layout)?), Some(lock))
            }
        };

        let runner = match self.runner {
            Some(r) => r,
            None => select_runner(&config.runner)?,
        };
        let tunnel_client = match self.tunnel_client {
            Some(c) => c,
            None => select_tunnel_client(
                &config.tunnel_provider,
                Arc::clone(&runner),
                &config.cloudflared_bin,
                config.tunnel_timeout(),
                config.grace_period(),
            )?,
        };

        info!(
            "orchestrator starting: {} package(s), runner={}, tunnels={}",
            catalog.len(),
            runner.name(),
            tunnel_client.name()
        );

        let inner = Inner {
            tunnels: TunnelManager::new(tunnel_client, config.tunnel_timeout()),
            bus: EventBus::new(config.event_queue_capacity),
            catalog: RwLock::new(catalog),
            store,
            runner,
            slots: Mutex::new(HashMap::new()),
            operations: Mutex::new(OperationTable::default()),
            handle,
            _lock: store_lock,
            config,
        };
        inner.recover()?;
        Ok(Orchestrator {
            inner: Arc::new(inner),
        })
    }
}

/// Drives packages through install, run, stop, and tunnel operations.
///
/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(config: PinionConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &PinionConfig {
        &self.inner.config
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn runner_name(&self) -> &str {
        self.inner.runner.name()
    }

    pub fn runner_available(&self) -> bool {
        self.inner.runner.available()
    }

    pub fn tunnel_provider(&self) -> &str {
        self.inner.tunnels.provider()
    }

    /// Request an operation. Returns as soon as the request is accepted;
    /// the work happens on a supervising task.
    pub fn submit(&self, package: &str, kind: OperationKind) -> Result<OperationId, CoreError> {
        let inner = &self.inner;
        validate_package_id(package)?;
        let package = inner.package(package)?;
        if matches!(kind, OperationKind::Install | OperationKind::Run) && !inner.runner.available()
        {
            return Err(CoreError::RunnerUnavailable(inner.runner.name().to_owned()));
        }

        let slot_ref = inner.slot(&package.id);
        let mut slot = lock(&slot_ref);
        if let Some(active) = &slot.active {
            if active.kind == kind || active.kind.is_tunnel() {
                return Err(CoreError::AlreadyInProgress {
                    package: package.id.clone(),
                    operation: active.id.clone(),
                });
            }
        }
        plan_transition(slot.record.phase, kind)?;

        let op = OperationId::generate();
        let entry = inner.register_operation(&op, &package.id, kind);
        debug!("[{}] accepted {kind} as {op}", package.id);

        match kind {
            OperationKind::Install => {
                slot.attempt += 1;
                slot.record.install_progress = 0;
                slot.record.progress_determinate = false;
                slot.record.last_error = None;
                inner.transition(&mut slot, LifecyclePhase::Installing, Some(&op));
                inner.publish(
                    &package.id,
                    Some(&op),
                    EventKind::Progress {
                        percent: 0,
                        determinate: false,
                    },
                );
                slot.active = Some(ActiveOperation { id: op.clone(), kind });
                let task = Arc::clone(inner);
                let cancel = entry.cancel_token();
                let task_op = op.clone();
                inner
                    .handle
                    .spawn(async move { task.install_task(package, task_op, cancel).await });
            }
            OperationKind::Run => {
                slot.attempt += 1;
                slot.record.last_error = None;
                let spawned = {
                    let _rt = inner.handle.enter();
                    plan::run_command(&package, &inner.config.apps_dir()).and_then(|spec| {
                        info!("[{}] starting: {}", package.id, spec.display());
                        inner
                            .runner
                            .spawn(&spec)
                            .map_err(|e| CoreError::ProcessSpawnFailure(e.to_string()))
                    })
                };
                match spawned {
                    Ok(SpawnedProcess { output, controller }) => {
                        slot.process = Some(controller.clone());
                        inner.transition(&mut slot, LifecyclePhase::Starting, Some(&op));
                        slot.active = Some(ActiveOperation { id: op.clone(), kind });
                        let task = Arc::clone(inner);
                        let cancel = entry.cancel_token();
                        let attempt = slot.attempt;
                        let task_op = op.clone();
                        inner.handle.spawn(async move {
                            task.run_task(package, task_op, output, controller, attempt, cancel)
                                .await;
                        });
                    }
                    Err(e) => {
                        warn!("[{}] run failed to start: {e}", package.id);
                        inner.transition(&mut slot, LifecyclePhase::Starting, Some(&op));
                        inner.fail_attempt(&mut slot, LifecyclePhase::RunFailed, &op, kind, &e);
                    }
                }
            }
            OperationKind::Stop => {
                let controller = slot.process.clone();
                inner.transition(&mut slot, LifecyclePhase::Stopping, Some(&op));
                slot.active = Some(ActiveOperation { id: op.clone(), kind });
                let task = Arc::clone(inner);
                let id = package.id.clone();
                let task_op = op.clone();
                inner.handle.spawn(async move {
                    task.stop_task(id, task_op, controller).await;
                });
            }
            OperationKind::CreateTunnel => {
                if let Some(tunnel) = slot.record.tunnel.clone() {
                    debug!("[{}] tunnel already open at {}", package.id, tunnel.url);
                    inner.finish(
                        &mut slot,
                        &op,
                        kind,
                        Outcome::Succeeded {
                            tunnel_url: Some(tunnel.url),
                        },
                    );
                } else {
                    slot.active = Some(ActiveOperation { id: op.clone(), kind });
                    let task = Arc::clone(inner);
                    let attempt = slot.attempt;
                    let task_op = op.clone();
                    inner.handle.spawn(async move {
                        task.open_tunnel_task(package, task_op, attempt).await;
                    });
                }
            }
            OperationKind::CloseTunnel => {
                if slot.record.tunnel.is_none() {
                    inner.finish(&mut slot, &op, kind, Outcome::succeeded());
                } else {
                    slot.active = Some(ActiveOperation { id: op.clone(), kind });
                    let task = Arc::clone(inner);
                    let id = package.id.clone();
                    let task_op = op.clone();
                    inner.handle.spawn(async move {
                        task.close_tunnel_task(id, task_op).await;
                    });
                }
            }
        }
        Ok(op)
    }

    /// Ask a running install or run to stop. False if the operation already
    /// finished or is not cancellable.
    pub fn cancel(&self, operation: &str) -> Result<bool, CoreError> {
        let entry = self.inner.operation_entry(operation)?;
        let requested = entry.request_cancel();
        if requested {
            info!("cancellation requested for {operation}");
        }
        Ok(requested)
    }

    pub fn operation(&self, operation: &str) -> Result<OperationReport, CoreError> {
        Ok(self.inner.operation_entry(operation)?.report())
    }

    /// Wait up to `timeout` for the operation to finish. On timeout the
    /// operation keeps running.
    pub async fn await_operation(
        &self,
        operation: &str,
        timeout: Duration,
    ) -> Result<OperationReport, CoreError> {
        let entry = self.inner.operation_entry(operation)?;
        let mut rx = entry.watch_report();
        let waited = tokio::time::timeout(timeout, async {
            let _ = rx.wait_for(OperationReport::is_terminal).await;
        })
        .await;
        if waited.is_err() {
            return Err(CoreError::Timeout(format!(
                "operation {operation} still running after {timeout:?}"
            )));
        }
        let report = rx.borrow().clone();
        Ok(report)
    }

    /// [`await_operation`](Self::await_operation) for threads outside the
    /// runtime. Must not be called from within an async context.
    pub fn await_operation_blocking(
        &self,
        operation: &str,
        timeout: Duration,
    ) -> Result<OperationReport, CoreError> {
        self.inner
            .handle
            .block_on(self.await_operation(operation, timeout))
    }

    pub fn list_packages(&self) -> Vec<PackageSummary> {
        let packages: Vec<Package> = self.inner.catalog().iter().cloned().collect();
        packages
            .into_iter()
            .map(|package| {
                let existing = lock(&self.inner.slots).get(&package.id).cloned();
                let (phase, install_progress, tunnel_url) = match existing {
                    Some(slot_ref) => {
                        let slot = lock(&slot_ref);
                        (
                            slot.record.phase,
                            slot.record.install_progress,
                            slot.record.tunnel.as_ref().map(|t| t.url.clone()),
                        )
                    }
                    None => (LifecyclePhase::NotInstalled, 0, None),
                };
                PackageSummary {
                    installed: phase.is_installed(),
                    running: phase.is_running(),
                    phase,
                    install_progress,
                    tunnel_url,
                    id: package.id,
                    name: package.name,
                    description: package.description,
                    category: package.category,
                    tags: package.tags,
                    resource_hint: package.resource_hint,
                }
            })
            .collect()
    }

    pub fn inspect(&self, package: &str) -> Result<PackageSnapshot, CoreError> {
        validate_package_id(package)?;
        let package = self.inner.package(package)?;
        let slot_ref = self.inner.slot(&package.id);
        let slot = lock(&slot_ref);
        let record = &slot.record;
        Ok(PackageSnapshot {
            phase: record.phase,
            install_progress: record.install_progress,
            progress_determinate: record.progress_determinate,
            tunnel: record.tunnel.clone(),
            log_tail: record.log_tail.lines().map(str::to_owned).collect(),
            last_error: record.last_error.clone(),
            version: record.version,
            updated_at: record.updated_at.clone(),
            pid: slot.process.as_ref().map(ProcessController::pid),
            active_operation: slot.active.as_ref().map(|a| a.id.clone()),
            package,
        })
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            environment: true,
            repository: self.inner.config.apps_dir().is_dir(),
            database: !self.inner.catalog().is_empty(),
            process_runner: self.inner.runner.available(),
        }
    }

    /// Re-read the catalog file. Packages that disappear keep their state
    /// until the next restart but can no longer be operated on.
    pub fn reload_catalog(&self) -> Result<usize, CoreError> {
        let catalog = Catalog::load(&self.inner.config.catalog_path())?;
        for w in catalog.warnings() {
            warn!("catalog: {w}");
        }
        let count = catalog.len();
        *self
            .inner
            .catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner) = catalog;
        info!("catalog reloaded: {count} package(s)");
        Ok(count)
    }

    pub fn subscribe(&self, package: Option<&str>) -> Subscription {
        self.inner.bus.subscribe(package.map(PackageId::new))
    }

    /// Stop every running package, cancel in-flight installs and runs, and
    /// close all tunnels.
    pub async fn shutdown(&self) {
        let slots: Vec<(PackageId, SlotRef)> = lock(&self.inner.slots)
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect();

        let mut pending = Vec::new();
        for (id, slot_ref) in slots {
            let active = lock(&slot_ref).active.as_ref().map(|a| a.id.clone());
            if let Some(op) = active {
                if self.cancel(&op).unwrap_or(false) {
                    pending.push(op);
                    continue;
                }
                // Tunnel operations are not cancellable; Stop is refused
                // until they settle.
                let settle = self.inner.config.tunnel_timeout() + Duration::from_secs(1);
                if let Err(e) = self.await_operation(&op, settle).await {
                    warn!("[{id}] shutdown: {e}");
                }
            }
            let phase = lock(&slot_ref).record.phase;
            if phase == LifecyclePhase::Running {
                match self.submit(&id, OperationKind::Stop) {
                    Ok(op) => pending.push(op),
                    Err(e) => warn!("[{id}] not stopped on shutdown: {e}"),
                }
            }
        }

        let limit = self.inner.config.grace_period() * 2 + Duration::from_secs(1);
        for op in pending {
            if let Err(e) = self.await_operation(&op, limit).await {
                warn!("shutdown: {e}");
            }
        }
        self.inner.tunnels.close_all().await;
        info!("orchestrator stopped");
    }
}

fn crash_report(exit: ExitInfo, context: &str, tail: Vec<String>) -> CoreError {
    CoreError::ProcessCrashed {
        exit_code: exit.code,
        reason: format!("{context} ({exit})"),
        tail,
    }
}

impl Inner {
    fn catalog(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn package(&self, id: &str) -> Result<Package, CoreError> {
        self.catalog()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::PackageNotFound(id.to_owned()))
    }

    /// Load persisted records and repair phases that cannot outlive the
    /// process that wrote them.
    fn recover(&self) -> Result<(), CoreError> {
        let records = self.store.list()?;
        let mut slots = lock(&self.slots);
        for mut record in records {
            record
                .log_tail
                .set_capacity(self.config.log_tail_lines);
            let recovered = match record.phase {
                LifecyclePhase::Installing => Some(LifecyclePhase::InstallFailed),
                LifecyclePhase::Starting | LifecyclePhase::Running | LifecyclePhase::Stopping => {
                    Some(LifecyclePhase::Installed)
                }
                _ => None,
            };
            let mut slot = Slot {
                record,
                process: None,
                active: None,
                attempt: 0,
            };
            if let Some(to) = recovered {
                let id = slot.record.package_id.clone();
                info!("[{id}] recovered from {} to {to}", slot.record.phase);
                if to == LifecyclePhase::InstallFailed {
                    slot.record.last_error = Some(FailureInfo {
                        kind: "interrupted".to_owned(),
                        message: "install interrupted by an orchestrator restart".to_owned(),
                        exit_code: None,
                        tail: Vec::new(),
                    });
                }
                slot.record.phase = to;
                slot.record.tunnel = None;
                slot.record.touch();
                self.persist(&mut slot);
            }
            slots.insert(
                slot.record.package_id.clone(),
                Arc::new(Mutex::new(slot)),
            );
        }
        debug!("recovered {} package record(s)", slots.len());
        Ok(())
    }

    /// The package's slot, created on first use.
    fn slot(&self, id: &PackageId) -> SlotRef {
        let mut slots = lock(&self.slots);
        if let Some(existing) = slots.get(id) {
            return Arc::clone(existing);
        }
        let record = match self.store.get(id) {
            Ok(Some(mut record)) => {
                record.log_tail.set_capacity(self.config.log_tail_lines);
                record
            }
            Ok(None) => PackageRecord::new(id.clone(), self.config.log_tail_lines),
            Err(e) => {
                warn!("[{id}] discarding unreadable record: {e}");
                PackageRecord::new(id.clone(), self.config.log_tail_lines)
            }
        };
        let slot = Arc::new(Mutex::new(Slot {
            record,
            process: None,
            active: None,
            attempt: 0,
        }));
        slots.insert(id.clone(), Arc::clone(&slot));
        slot
    }

    fn register_operation(
        &self,
        op: &OperationId,
        package: &PackageId,
        kind: OperationKind,
    ) -> Arc<OperationEntry> {
        let entry = Arc::new(OperationEntry::new(op.clone(), package.clone(), kind));
        let mut table = lock(&self.operations);
        table.entries.insert(op.clone(), Arc::clone(&entry));
        table.order.push_back(op.clone());
        while table.order.len() > OPERATION_HISTORY {
            let Some(oldest) = table.order.front().cloned() else {
                break;
            };
            let finished = table
                .entries
                .get(&oldest)
                .map_or(true, |e| e.is_terminal());
            if !finished {
                break;
            }
            table.order.pop_front();
            table.entries.remove(&oldest);
        }
        entry
    }

    fn operation_entry(&self, op: &str) -> Result<Arc<OperationEntry>, CoreError> {
        lock(&self.operations)
            .entries
            .get(op)
            .cloned()
            .ok_or_else(|| CoreError::OperationNotFound(op.to_owned()))
    }

    fn publish(&self, package: &PackageId, op: Option<&OperationId>, kind: EventKind) {
        self.bus.publish(package, op, kind);
    }

    /// Write the slot's record. On a version conflict the stored record is
    /// re-read and replaced: the slot supervises the package's processes, so
    /// its lifecycle state wins over whatever another writer left behind.
    fn persist(&self, slot: &mut Slot) {
        let id = slot.record.package_id.clone();
        let mut expected = slot.record.version;
        for _ in 0..=self.config.store_retries {
            match self.store.put(&slot.record, expected) {
                Ok(stored) => {
                    slot.record.version = stored.version;
                    slot.record.checksum = stored.checksum;
                    return;
                }
                Err(StoreError::Conflict { found, .. }) => {
                    expected = match self.store.get(&id) {
                        Ok(Some(stored)) => {
                            warn!(
                                "[{id}] store conflict at version {expected}: replacing stored {} at version {}",
                                stored.phase, stored.version
                            );
                            stored.version
                        }
                        Ok(None) => 0,
                        Err(e) => {
                            warn!("[{id}] store conflict at version {expected}, re-read failed: {e}");
                            found
                        }
                    };
                }
                Err(e @ (StoreError::IntegrityFailure { .. } | StoreError::Serialization(_))) => {
                    warn!("[{id}] replacing damaged record: {e}");
                    if let Err(e) = self.store.remove(&id) {
                        error!("[{id}] failed to remove damaged record: {e}");
                        return;
                    }
                    expected = 0;
                }
                Err(e) => {
                    error!("[{id}] failed to persist state: {e}");
                    return;
                }
            }
        }
        error!(
            "[{id}] giving up on persisting state after {} retries",
            self.config.store_retries
        );
    }

    /// Move to `to`, persist, and announce it. Leaving the process phases
    /// drops the process handle; leaving `Running` drops the tunnel.
    fn transition(&self, slot: &mut Slot, to: LifecyclePhase, op: Option<&OperationId>) {
        let from = slot.record.phase;
        let id = slot.record.package_id.clone();
        if let Err(e) = validate_transition(from, to) {
            error!("[{id}] refusing internal transition: {e}");
            return;
        }
        slot.record.phase = to;
        if !to.has_process() {
            slot.process = None;
        }
        let dropped_tunnel = if to.is_running() {
            false
        } else {
            slot.record.tunnel.take().is_some()
        };
        slot.record.touch();
        self.persist(slot);
        info!("[{id}] {from} -> {to}");
        if dropped_tunnel {
            self.publish(&id, op, EventKind::TunnelChanged { url: None });
        }
        self.publish(
            &id,
            op,
            EventKind::StateChanged {
                from,
                to,
                version: slot.record.version,
            },
        );
    }

    /// Record the terminal outcome and release the package for new requests.
    fn finish(&self, slot: &mut Slot, op: &OperationId, kind: OperationKind, outcome: Outcome) {
        if slot.active.as_ref().is_some_and(|a| &a.id == op) {
            slot.active = None;
        }
        if let Ok(entry) = self.operation_entry(op) {
            entry.finish(outcome.clone());
        }
        let id = slot.record.package_id.clone();
        debug!("[{id}] {kind} {op} finished: {outcome:?}");
        self.publish(&id, Some(op), EventKind::OperationFinished { kind, outcome });
    }

    fn fail_attempt(
        &self,
        slot: &mut Slot,
        to: LifecyclePhase,
        op: &OperationId,
        kind: OperationKind,
        error: &CoreError,
    ) {
        let failure = error.to_failure();
        slot.record.last_error = Some(failure.clone());
        self.transition(slot, to, Some(op));
        self.finish(slot, op, kind, Outcome::Failed { error: failure });
    }

    fn cancel_attempt(&self, slot: &mut Slot, to: LifecyclePhase, op: &OperationId, kind: OperationKind) {
        slot.record.last_error = Some(FailureInfo {
            kind: "cancelled".to_owned(),
            message: format!("{kind} cancelled"),
            exit_code: None,
            tail: Vec::new(),
        });
        self.transition(slot, to, Some(op));
        self.finish(slot, op, kind, Outcome::Cancelled);
    }

    fn set_progress(&self, slot: &mut Slot, op: &OperationId, percent: u8, determinate: bool) {
        slot.record.install_progress = percent;
        slot.record.progress_determinate = determinate;
        slot.record.touch();
        self.persist(slot);
        let id = slot.record.package_id.clone();
        self.publish(
            &id,
            Some(op),
            EventKind::Progress {
                percent,
                determinate,
            },
        );
    }

    /// Append a line to the log tail and publish it. During an install the
    /// line is also scanned for progress markers.
    fn record_line(
        &self,
        id: &PackageId,
        op: Option<&OperationId>,
        line: OutputLine,
        tracker: Option<&mut ProgressTracker>,
    ) {
        let slot_ref = self.slot(id);
        let mut slot = lock(&slot_ref);
        slot.record.log_tail.push(line.line.as_str());
        let marker = progress::parse_marker(&line.line);
        self.publish(
            id,
            op,
            EventKind::LogLine {
                stream: line.stream,
                line: line.line,
            },
        );
        if let (Some(tracker), Some(marker), Some(op)) = (tracker, marker, op) {
            if let Some(percent) = tracker.observe(marker) {
                let determinate = tracker.determinate();
                self.set_progress(&mut slot, op, percent, determinate);
            }
        }
    }

    /// Must not be called with the package's slot locked.
    fn crash(&self, id: &PackageId, exit: ExitInfo, context: &str) -> CoreError {
        let tail = lock(&self.slot(id)).record.log_tail.last(CRASH_TAIL);
        crash_report(exit, context, tail)
    }

    /// Forward whatever output is still buffered once the process is gone.
    async fn drain(&self, id: &PackageId, op: Option<&OperationId>, output: &mut ProcessOutput) {
        while let Ok(Some(line)) = tokio::time::timeout(DRAIN_TIMEOUT, output.next_line()).await {
            self.record_line(id, op, line, None);
        }
    }

    async fn install_task(self: Arc<Self>, package: Package, op: OperationId, mut cancel: CancelToken) {
        let result = self.install(&package, &op, &mut cancel).await;
        let slot_ref = self.slot(&package.id);
        let mut slot = lock(&slot_ref);
        match result {
            Ok(()) => {
                if slot.record.install_progress != 100 || !slot.record.progress_determinate {
                    self.set_progress(&mut slot, &op, 100, true);
                }
                self.transition(&mut slot, LifecyclePhase::Installed, Some(&op));
                self.finish(&mut slot, &op, OperationKind::Install, Outcome::succeeded());
            }
            Err(Interrupted::Cancelled) => {
                self.cancel_attempt(
                    &mut slot,
                    LifecyclePhase::InstallFailed,
                    &op,
                    OperationKind::Install,
                );
            }
            Err(Interrupted::Failed(e)) => {
                warn!("[{}] install failed: {e}", package.id);
                self.fail_attempt(
                    &mut slot,
                    LifecyclePhase::InstallFailed,
                    &op,
                    OperationKind::Install,
                    &e,
                );
            }
        }
    }

    async fn install(
        &self,
        package: &Package,
        op: &OperationId,
        cancel: &mut CancelToken,
    ) -> Result<(), Interrupted> {
        let id = &package.id;
        let apps_dir = self.config.apps_dir();
        std::fs::create_dir_all(&apps_dir).map_err(CoreError::from)?;
        let steps = plan::install_plan(package, &apps_dir)?;
        let mut tracker = ProgressTracker::new(steps.len());

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Interrupted::Cancelled);
            }
            tracker.begin_step(index);
            let Some(spec) = step.resolve() else {
                debug!("[{id}] install step {} has nothing to do", index + 1);
                self.complete_step(id, op, &mut tracker);
                continue;
            };
            info!(
                "[{id}] install step {}/{}: {}",
                index + 1,
                steps.len(),
                spec.display()
            );
            let SpawnedProcess {
                mut output,
                controller,
            } = self
                .runner
                .spawn(&spec)
                .map_err(|e| CoreError::ProcessSpawnFailure(e.to_string()))?;

            let mut open = true;
            let exit = loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        let exit = controller.terminate(self.config.grace_period()).await;
                        info!("[{id}] install cancelled, process ended with {exit}");
                        return Err(Interrupted::Cancelled);
                    }
                    line = output.next_line(), if open => match line {
                        Some(line) => self.record_line(id, Some(op), line, Some(&mut tracker)),
                        None => open = false,
                    },
                    exit = controller.wait() => break exit,
                }
            };
            if open {
                while let Ok(Some(line)) =
                    tokio::time::timeout(DRAIN_TIMEOUT, output.next_line()).await
                {
                    self.record_line(id, Some(op), line, Some(&mut tracker));
                }
            }
            if !exit.success() {
                return Err(self.crash(id, exit, &format!("{} failed", spec.program)).into());
            }
            self.complete_step(id, op, &mut tracker);
        }
        Ok(())
    }

    fn complete_step(&self, id: &PackageId, op: &OperationId, tracker: &mut ProgressTracker) {
        if let Some(percent) = tracker.complete_step() {
            let slot_ref = self.slot(id);
            let mut slot = lock(&slot_ref);
            self.set_progress(&mut slot, op, percent, true);
        }
    }

    async fn run_task(
        self: Arc<Self>,
        package: Package,
        op: OperationId,
        mut output: ProcessOutput,
        controller: ProcessController,
        attempt: u64,
        mut cancel: CancelToken,
    ) {
        let id = package.id.clone();
        let ready = self
            .await_ready(&package, &op, &mut output, &controller, &mut cancel)
            .await;
        {
            let slot_ref = self.slot(&id);
            let mut slot = lock(&slot_ref);
            match ready {
                Ok(()) => {
                    info!("[{id}] ready on port {}", package.port);
                    self.transition(&mut slot, LifecyclePhase::Running, Some(&op));
                    self.finish(&mut slot, &op, OperationKind::Run, Outcome::succeeded());
                }
                Err(Interrupted::Cancelled) => {
                    self.cancel_attempt(&mut slot, LifecyclePhase::RunFailed, &op, OperationKind::Run);
                    return;
                }
                Err(Interrupted::Failed(e)) => {
                    warn!("[{id}] run failed: {e}");
                    self.fail_attempt(&mut slot, LifecyclePhase::RunFailed, &op, OperationKind::Run, &e);
                    return;
                }
            }
        }

        // Keep streaming logs for as long as the process lives.
        let mut open = true;
        let exit = loop {
            tokio::select! {
                biased;
                line = output.next_line(), if open => match line {
                    Some(line) => self.record_line(&id, None, line, None),
                    None => open = false,
                },
                exit = controller.wait() => break exit,
            }
        };
        if open {
            self.drain(&id, None, &mut output).await;
        }

        let close_tunnel = {
            let slot_ref = self.slot(&id);
            let mut slot = lock(&slot_ref);
            if slot.attempt == attempt && slot.record.phase == LifecyclePhase::Running {
                let tail = slot.record.log_tail.last(CRASH_TAIL);
                let e = crash_report(exit, "process exited unexpectedly", tail);
                warn!("[{id}] {e}");
                slot.record.last_error = Some(e.to_failure());
                self.transition(&mut slot, LifecyclePhase::RunFailed, None);
                true
            } else {
                debug!("[{id}] process ended with {exit}");
                false
            }
        };
        // A newer attempt may already own a fresh tunnel by now.
        if close_tunnel {
            if let Err(e) = self.tunnels.close_owned(&id, attempt).await {
                warn!("[{id}] {e}");
            }
        }
    }

    async fn await_ready(
        &self,
        package: &Package,
        op: &OperationId,
        output: &mut ProcessOutput,
        controller: &ProcessController,
        cancel: &mut CancelToken,
    ) -> Result<(), Interrupted> {
        let id = &package.id;
        let marker = package.ready_marker.as_deref().filter(|m| !m.is_empty());
        let deadline = tokio::time::sleep(self.config.ready_timeout());
        let fallback = tokio::time::sleep(self.config.ready_delay());
        tokio::pin!(deadline, fallback);
        let mut open = true;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let exit = controller.terminate(self.config.grace_period()).await;
                    info!("[{id}] run cancelled, process ended with {exit}");
                    return Err(Interrupted::Cancelled);
                }
                line = output.next_line(), if open => match line {
                    Some(line) => {
                        let ready = plan::is_ready_line(&line.line, marker);
                        self.record_line(id, Some(op), line, None);
                        if ready {
                            return Ok(());
                        }
                    }
                    None => open = false,
                },
                exit = controller.wait() => {
                    if open {
                        self.drain(id, Some(op), output).await;
                    }
                    return Err(self.crash(id, exit, "exited before becoming ready").into());
                }
                () = &mut fallback, if marker.is_none() => {
                    debug!("[{id}] no readiness marker seen, assuming ready after {:?}", self.config.ready_delay());
                    return Ok(());
                }
                () = &mut deadline => {
                    controller.terminate(self.config.grace_period()).await;
                    return Err(CoreError::Timeout(format!(
                        "{id} did not become ready within {:?}",
                        self.config.ready_timeout()
                    ))
                    .into());
                }
            }
        }
    }

    async fn stop_task(
        self: Arc<Self>,
        id: PackageId,
        op: OperationId,
        controller: Option<ProcessController>,
    ) {
        if let Err(e) = self.tunnels.close(&id).await {
            warn!("[{id}] {e}");
        }
        if let Some(controller) = controller {
            let exit = controller.terminate(self.config.grace_period()).await;
            info!("[{id}] stopped ({exit})");
        }
        let slot_ref = self.slot(&id);
        let mut slot = lock(&slot_ref);
        self.transition(&mut slot, LifecyclePhase::Installed, Some(&op));
        self.finish(&mut slot, &op, OperationKind::Stop, Outcome::succeeded());
    }

    async fn open_tunnel_task(self: Arc<Self>, package: Package, op: OperationId, attempt: u64) {
        let id = package.id.clone();
        let result = self.tunnels.open(&id, package.port, attempt).await;
        let orphaned = {
            let slot_ref = self.slot(&id);
            let mut slot = lock(&slot_ref);
            let still_running =
                slot.attempt == attempt && slot.record.phase == LifecyclePhase::Running;
            match result {
                Ok((tunnel, _)) if still_running => {
                    let url = tunnel.url.clone();
                    slot.record.tunnel = Some(tunnel);
                    slot.record.touch();
                    self.persist(&mut slot);
                    self.publish(
                        &id,
                        Some(&op),
                        EventKind::TunnelChanged {
                            url: Some(url.clone()),
                        },
                    );
                    self.finish(
                        &mut slot,
                        &op,
                        OperationKind::CreateTunnel,
                        Outcome::Succeeded {
                            tunnel_url: Some(url),
                        },
                    );
                    false
                }
                Ok(_) => {
                    let e = CoreError::TunnelUnavailable(format!(
                        "{id} stopped before the tunnel was established"
                    ));
                    self.finish(
                        &mut slot,
                        &op,
                        OperationKind::CreateTunnel,
                        Outcome::Failed {
                            error: e.to_failure(),
                        },
                    );
                    true
                }
                Err(e) => {
                    error!("[{id}] {e}");
                    let failure = e.to_failure();
                    slot.record.last_error = Some(failure.clone());
                    slot.record.touch();
                    self.persist(&mut slot);
                    self.finish(
                        &mut slot,
                        &op,
                        OperationKind::CreateTunnel,
                        Outcome::Failed { error: failure },
                    );
                    false
                }
            }
        };
        if orphaned {
            if let Err(e) = self.tunnels.close_owned(&id, attempt).await {
                warn!("[{id}] {e}");
            }
        }
    }

    async fn close_tunnel_task(self: Arc<Self>, id: PackageId, op: OperationId) {
        let result = self.tunnels.close(&id).await;
        let slot_ref = self.slot(&id);
        let mut slot = lock(&slot_ref);
        if let Err(e) = &result {
            warn!("[{id}] {e}");
        }
        if slot.record.tunnel.take().is_some() {
            slot.record.touch();
            self.persist(&mut slot);
            self.publish(&id, Some(&op), EventKind::TunnelChanged { url: None });
        }
        let outcome = match result {
            Ok(_) => Outcome::succeeded(),
            Err(e) => Outcome::Failed {
                error: e.to_failure(),
            },
        };
        self.finish(&mut slot, &op, OperationKind::CloseTunnel, outcome);
    }
}
