//! HTTP front end for the Pinion orchestrator.
//!
//! Every request is handled on its own thread so that long-lived event
//! streams never hold up ordinary requests. Handlers call the
//! [`Orchestrator`] directly and block on its runtime only where a route
//! waits for an operation (`POST /packages/{id}/tunnel`,
//! `GET /operations/{op}?wait_ms=N`).
//!
//! The [`TestServer`] helper starts a server on a random port for
//! integration testing.

pub mod sse;

use pinion_core::{shutdown_requested, CoreError, OperationKind, Orchestrator, Outcome};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

/// How often the accept loop checks for a shutdown request.
const ACCEPT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("config error: {0}")]
    Config(#[from] pinion_schema::ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Health,
    Status,
    Packages,
    Events,
    Package(&'a str),
    Action(&'a str, OperationKind),
    Tunnel(&'a str),
    PackageEvents(&'a str),
    Operation(&'a str),
    CancelOperation(&'a str),
}

/// Map a request path (without query string) to a route.
pub fn parse_route(path: &str) -> Option<Route<'_>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let route = match segments[..] {
        ["health"] => Route::Health,
        ["status"] => Route::Status,
        ["packages"] => Route::Packages,
        ["events"] => Route::Events,
        ["packages", id] => Route::Package(id),
        ["packages", id, "install"] => Route::Action(id, OperationKind::Install),
        ["packages", id, "run"] => Route::Action(id, OperationKind::Run),
        ["packages", id, "stop"] => Route::Action(id, OperationKind::Stop),
        ["packages", id, "tunnel"] => Route::Tunnel(id),
        ["packages", id, "events"] => Route::PackageEvents(id),
        ["operations", op] => Route::Operation(op),
        ["operations", op, "cancel"] => Route::CancelOperation(op),
        _ => return None,
    };
    Some(route)
}

pub fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

pub fn status_for(e: &CoreError) -> u16 {
    match e {
        CoreError::InvalidTransition { .. } | CoreError::AlreadyInProgress { .. } => 409,
        CoreError::PackageNotFound(_) | CoreError::OperationNotFound(_) => 404,
        CoreError::InvalidId(_) => 400,
        _ => 500,
    }
}

fn respond_json(req: Request, status: u16, body: &impl Serialize) {
    let data = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::from_data(data).with_status_code(StatusCode(status));
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response.add_header(header);
    }
    let _ = req.respond(response);
}

fn respond_err(req: Request, code: u16, msg: &str) {
    respond_json(req, code, &json!({ "error": msg }));
}

/// Error response for a failed orchestrator call. Conflicts carry the
/// package's current phase and the rejected request.
fn respond_core_error(
    orch: &Orchestrator,
    req: Request,
    e: &CoreError,
    requested: Option<OperationKind>,
) {
    let status = status_for(e);
    let mut body = json!({ "error": e.to_string(), "kind": e.kind() });
    match e {
        CoreError::InvalidTransition { from, requested } => {
            body["currentPhase"] = json!(from);
            body["requested"] = json!(requested);
        }
        CoreError::AlreadyInProgress { package, operation } => {
            body["operationId"] = json!(operation);
            if let Ok(snapshot) = orch.inspect(package) {
                body["currentPhase"] = json!(snapshot.phase);
            }
            if let Some(kind) = requested {
                body["requested"] = json!(kind);
            }
        }
        _ => {}
    }
    if status >= 500 {
        error!("{e}");
    } else {
        debug!("{e}");
    }
    respond_json(req, status, &body);
}

fn handle_action(orch: &Orchestrator, req: Request, id: &str, kind: OperationKind) {
    match orch.submit(id, kind) {
        Ok(op) => {
            info!("[{id}] {kind} accepted as {op}");
            respond_json(req, 202, &json!({ "operationId": op }));
        }
        Err(e) => respond_core_error(orch, req, &e, Some(kind)),
    }
}

/// Submit a tunnel request (or join the one already in flight) and wait up
/// to `tunnel_wait` for it.
fn handle_tunnel(orch: &Orchestrator, req: Request, method: &Method, id: &str) {
    let kind = match *method {
        Method::Post => OperationKind::CreateTunnel,
        Method::Delete => OperationKind::CloseTunnel,
        _ => return respond_err(req, 405, "method not allowed"),
    };
    let op = match orch.submit(id, kind) {
        Ok(op) => op,
        Err(CoreError::AlreadyInProgress { operation, .. })
            if orch
                .operation(&operation)
                .is_ok_and(|report| report.kind == kind) =>
        {
            debug!("[{id}] joining {kind} {operation}");
            operation
        }
        Err(e) => return respond_core_error(orch, req, &e, Some(kind)),
    };

    match orch.await_operation_blocking(&op, orch.config().tunnel_wait()) {
        Ok(report) => match &report.outcome {
            Outcome::Succeeded { tunnel_url } => match kind {
                OperationKind::CreateTunnel => respond_json(
                    req,
                    200,
                    &json!({ "url": tunnel_url, "operationId": op }),
                ),
                _ => respond_json(req, 200, &json!({ "closed": true, "operationId": op })),
            },
            Outcome::Failed { error } => {
                warn!("[{id}] {kind} failed: {}", error.message);
                respond_json(
                    req,
                    500,
                    &json!({ "error": error.message, "kind": error.kind, "operationId": op }),
                );
            }
            Outcome::Cancelled | Outcome::Pending => respond_json(req, 202, &report),
        },
        Err(CoreError::Timeout(_)) => respond_json(req, 202, &json!({ "operationId": op })),
        Err(e) => respond_core_error(orch, req, &e, Some(kind)),
    }
}

fn handle_operation(orch: &Orchestrator, req: Request, op: &str, query: &str) {
    let wait_ms = query_param(query, "wait_ms").and_then(|v| v.parse::<u64>().ok());
    let result = match wait_ms {
        Some(ms) if ms > 0 => match orch.await_operation_blocking(op, Duration::from_millis(ms)) {
            Err(CoreError::Timeout(_)) => orch.operation(op),
            other => other,
        },
        _ => orch.operation(op),
    };
    match result {
        Ok(report) => respond_json(req, 200, &report),
        Err(e) => respond_core_error(orch, req, &e, None),
    }
}

fn handle_events(orch: &Orchestrator, req: Request, package: Option<&str>) {
    if let Some(id) = package {
        if let Err(e) = orch.inspect(id) {
            return respond_core_error(orch, req, &e, None);
        }
    }
    let subscription = orch.subscribe(package);
    debug!("event stream opened for {}", package.unwrap_or("all packages"));
    let mut writer = req.into_writer();
    if let Err(e) = sse::stream_events(orch, subscription, &mut writer, sse::KEEP_ALIVE) {
        debug!("event stream closed: {e}");
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(orch: &Orchestrator, req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));
    let Some(route) = parse_route(path) else {
        return respond_err(req, 404, "not found");
    };

    match (route, &method) {
        (Route::Health, Method::Get) => respond_json(req, 200, &json!({ "status": "ok" })),
        (Route::Status, Method::Get) => respond_json(req, 200, &orch.status()),
        (Route::Packages, Method::Get) => respond_json(req, 200, &orch.list_packages()),
        (Route::Package(id), Method::Get) => match orch.inspect(id) {
            Ok(snapshot) => respond_json(req, 200, &snapshot),
            Err(e) => respond_core_error(orch, req, &e, None),
        },
        (Route::Action(id, kind), Method::Post) => handle_action(orch, req, id, kind),
        (Route::Tunnel(id), _) => handle_tunnel(orch, req, &method, id),
        (Route::Operation(op), Method::Get) => handle_operation(orch, req, op, query),
        (Route::CancelOperation(op), Method::Post) => match orch.cancel(op) {
            Ok(cancelled) => respond_json(req, 200, &json!({ "cancelled": cancelled })),
            Err(e) => respond_core_error(orch, req, &e, None),
        },
        (Route::PackageEvents(id), Method::Get) => handle_events(orch, req, Some(id)),
        (Route::Events, Method::Get) => {
            let package = query_param(query, "package").map(str::to_owned);
            handle_events(orch, req, package.as_deref());
        }
        _ => respond_err(req, 405, "method not allowed"),
    }
}

/// Hand the request to its own thread.
fn dispatch(orch: &Orchestrator, req: Request) {
    let orch = orch.clone();
    let spawned = std::thread::Builder::new()
        .name("pinion-http".to_owned())
        .spawn(move || handle_request(&orch, req));
    if let Err(e) = spawned {
        error!("cannot spawn request thread: {e}");
    }
}

pub fn bind(addr: &str) -> Result<Server, ServerError> {
    Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })
}

/// Serve until Ctrl-C, blocking the current thread.
pub fn run_server(orch: &Orchestrator, addr: &str) -> Result<(), ServerError> {
    let server = bind(addr)?;
    info!("listening on http://{addr}");
    while !shutdown_requested() {
        match server.recv_timeout(ACCEPT_POLL) {
            Ok(Some(request)) => dispatch(orch, request),
            Ok(None) => {}
            Err(e) => warn!("accept failed: {e}"),
        }
    }
    info!("no longer accepting requests");
    Ok(())
}

/// A test helper that serves an orchestrator on a random port in a
/// background thread.
///
/// The server listens on `127.0.0.1:{port}`. Dropping the `TestServer`
/// stops the accept loop.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub orchestrator: Orchestrator,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

impl TestServer {
    pub fn start(orchestrator: Orchestrator) -> Result<Self, ServerError> {
        let server = Arc::new(bind("127.0.0.1:0")?);
        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .ok_or_else(|| ServerError::Bind {
                addr: "127.0.0.1:0".to_owned(),
                reason: "not an IP address".to_owned(),
            })?;
        let url = format!("http://127.0.0.1:{port}");

        let srv = Arc::clone(&server);
        let orch = orchestrator.clone();
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                dispatch(&orch, request);
            }
        });

        Ok(Self {
            url,
            port,
            orchestrator,
            server,
            _handle: handle,
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_package_routes() {
        assert_eq!(parse_route("/packages"), Some(Route::Packages));
        assert_eq!(parse_route("/packages/"), Some(Route::Packages));
        assert_eq!(parse_route("/packages/comfyui"), Some(Route::Package("comfyui")));
        assert_eq!(
            parse_route("/packages/comfyui/install"),
            Some(Route::Action("comfyui", OperationKind::Install))
        );
        assert_eq!(
            parse_route("/packages/comfyui/stop"),
            Some(Route::Action("comfyui", OperationKind::Stop))
        );
        assert_eq!(
            parse_route("/packages/comfyui/tunnel"),
            Some(Route::Tunnel("comfyui"))
        );
        assert_eq!(
            parse_route("/packages/comfyui/events"),
            Some(Route::PackageEvents("comfyui"))
        );
    }

    #[test]
    fn parse_operation_routes() {
        assert_eq!(parse_route("/operations/abc"), Some(Route::Operation("abc")));
        assert_eq!(
            parse_route("/operations/abc/cancel"),
            Some(Route::CancelOperation("abc"))
        );
    }

    #[test]
    fn unknown_routes() {
        assert_eq!(parse_route("/"), None);
        assert_eq!(parse_route("/packages/a/b/c"), None);
        assert_eq!(parse_route("/packages/a/uninstall"), None);
        assert_eq!(parse_route("/blobs/Object/x"), None);
    }

    #[test]
    fn empty_id_is_left_to_validation() {
        assert_eq!(
            parse_route("/packages//run"),
            Some(Route::Action("", OperationKind::Run))
        );
    }

    #[test]
    fn query_params() {
        assert_eq!(query_param("wait_ms=500", "wait_ms"), Some("500"));
        assert_eq!(query_param("a=1&package=p1", "package"), Some("p1"));
        assert_eq!(query_param("", "package"), None);
        assert_eq!(query_param("packagex=1", "package"), None);
    }

    #[test]
    fn error_status_codes() {
        use pinion_store::LifecyclePhase;
        let conflict = CoreError::InvalidTransition {
            from: LifecyclePhase::Installing,
            requested: OperationKind::Run,
        };
        assert_eq!(status_for(&conflict), 409);
        assert_eq!(status_for(&CoreError::PackageNotFound("x".to_owned())), 404);
        assert_eq!(status_for(&CoreError::OperationNotFound("x".to_owned())), 404);
        assert_eq!(
            status_for(&CoreError::TunnelUnavailable("down".to_owned())),
            500
        );
        assert_eq!(
            status_for(&CoreError::RunnerUnavailable("host".to_owned())),
            500
        );
        let invalid = pinion_schema::validate_package_id("../x").unwrap_err();
        assert_eq!(status_for(&CoreError::InvalidId(invalid)), 400);
    }
}
