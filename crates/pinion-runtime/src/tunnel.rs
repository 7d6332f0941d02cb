use crate::process::{CommandRole, CommandSpec, ProcessController, ProcessOutput, SpawnedProcess};
use crate::runner::ProcessRunner;
use crate::RuntimeError;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An established tunnel. Pass it back to [`TunnelClient::close`] to tear it down.
#[derive(Debug)]
pub struct TunnelHandle {
    url: String,
    process: Option<ProcessController>,
}

impl TunnelHandle {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            process: None,
        }
    }

    fn with_process(url: String, process: ProcessController) -> Self {
        Self {
            url,
            process: Some(process),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Opens outbound reverse-proxy connections to a local port.
///
/// Uses `Pin<Box<dyn Future>>` so the trait stays object-safe.
pub trait TunnelClient: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn open<'a>(
        &'a self,
        package: &'a str,
        local_port: u16,
    ) -> BoxFuture<'a, Result<TunnelHandle, RuntimeError>>;

    fn close(&self, handle: TunnelHandle) -> BoxFuture<'_, Result<(), RuntimeError>>;
}

/// Pull the public URL out of a line of cloudflared output.
pub fn parse_tunnel_url(line: &str) -> Option<String> {
    let start = line.find("https://")?;
    let candidate: String = line[start..]
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '|')
        .collect();
    let host = candidate.trim_start_matches("https://");
    let host = host.split('/').next().unwrap_or(host);
    if host.ends_with(".trycloudflare.com") && host != "api.trycloudflare.com" {
        Some(candidate.trim_end_matches('/').to_owned())
    } else {
        None
    }
}

/// Cloudflare quick tunnels: `cloudflared tunnel --url http://127.0.0.1:<port>`.
pub struct CloudflaredClient {
    runner: Arc<dyn ProcessRunner>,
    binary: String,
    timeout: Duration,
    grace: Duration,
}

impl CloudflaredClient {
    pub fn new(runner: Arc<dyn ProcessRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout: Duration::from_secs(30),
            grace: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeout: Duration, grace: Duration) -> Self {
        self.timeout = timeout;
        self.grace = grace;
        self
    }
}

async fn find_url(output: &mut ProcessOutput) -> Option<String> {
    while let Some(line) = output.next_line().await {
        debug!("cloudflared: {}", line.line);
        if let Some(url) = parse_tunnel_url(&line.line) {
            return Some(url);
        }
    }
    None
}

impl TunnelClient for CloudflaredClient {
    fn name(&self) -> &'static str {
        "cloudflared"
    }

    fn available(&self) -> bool {
        crate::prereq::command_exists(&self.binary)
    }

    fn open<'a>(
        &'a self,
        package: &'a str,
        local_port: u16,
    ) -> BoxFuture<'a, Result<TunnelHandle, RuntimeError>> {
        Box::pin(async move {
            let spec = CommandSpec::new(&self.binary, CommandRole::Tunnel)
                .args([
                    "tunnel".to_owned(),
                    "--no-autoupdate".to_owned(),
                    "--url".to_owned(),
                    format!("http://127.0.0.1:{local_port}"),
                ])
                .label(package);
            let SpawnedProcess {
                mut output,
                controller,
            } = self.runner.spawn(&spec)?;

            match tokio::time::timeout(self.timeout, find_url(&mut output)).await {
                Ok(Some(url)) => {
                    info!("[{package}] tunnel established: {url}");
                    // Keep draining so cloudflared never blocks on a full pipe.
                    let label = package.to_owned();
                    tokio::spawn(async move {
                        while let Some(line) = output.next_line().await {
                            debug!("[{label}] cloudflared: {}", line.line);
                        }
                    });
                    Ok(TunnelHandle::with_process(url, controller))
                }
                Ok(None) => {
                    let exit = controller.wait().await;
                    Err(RuntimeError::TunnelFailed(format!(
                        "cloudflared ended ({exit}) before publishing a URL"
                    )))
                }
                Err(_) => {
                    controller.terminate(self.grace).await;
                    Err(RuntimeError::Timeout(format!(
                        "no tunnel URL within {:?}",
                        self.timeout
                    )))
                }
            }
        })
    }

    fn close(&self, handle: TunnelHandle) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            if let Some(process) = handle.process {
                let exit = process.terminate(self.grace).await;
                debug!("tunnel {} closed ({exit})", handle.url);
            }
            Ok(())
        })
    }
}

/// Deterministic tunnels at `https://<package>-<suffix>.example.com`.
pub struct MockTunnelClient {
    opened: AtomicUsize,
    active: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
}

impl Default for MockTunnelClient {
    fn default() -> Self {
        Self {
            opened: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::from_millis(5),
        }
    }
}

impl MockTunnelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated connection latency.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Tunnels created over the client's lifetime.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Tunnels currently open.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl TunnelClient for MockTunnelClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        !self.fail.load(Ordering::SeqCst)
    }

    fn open<'a>(
        &'a self,
        package: &'a str,
        _local_port: u16,
    ) -> BoxFuture<'a, Result<TunnelHandle, RuntimeError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(RuntimeError::TunnelFailed(
                    "mock tunnel provider refused the connection".to_owned(),
                ));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_add(1, Ordering::SeqCst);
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            Ok(TunnelHandle::new(format!(
                "https://{package}-{}.example.com",
                &suffix[..4]
            )))
        })
    }

    fn close(&self, _handle: TunnelHandle) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            let _ = self
                .active
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            Ok(())
        })
    }
}

/// Build the tunnel backend named in the configuration.
pub fn select_tunnel_client(
    name: &str,
    runner: Arc<dyn ProcessRunner>,
    binary: &str,
    timeout: Duration,
    grace: Duration,
) -> Result<Arc<dyn TunnelClient>, RuntimeError> {
    match name {
        "cloudflared" => Ok(Arc::new(
            CloudflaredClient::new(runner, binary).with_timeouts(timeout, grace),
        )),
        "mock" => Ok(Arc::new(MockTunnelClient::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
