use crate::CoreError;
use pinion_runtime::{TunnelClient, TunnelHandle};
use pinion_schema::PackageId;
use pinion_store::TunnelInfo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

struct ActiveTunnel {
    handle: TunnelHandle,
    info: TunnelInfo,
    /// Run attempt the tunnel was opened for.
    owner: u64,
}

type TunnelSlot = Arc<tokio::sync::Mutex<Option<ActiveTunnel>>>;

/// At most one tunnel per package over a [`TunnelClient`].
///
/// Each package has its own async lock, so concurrent `open` calls for the
/// same package share one tunnel while different packages never wait on
/// each other.
pub struct TunnelManager {
    client: Arc<dyn TunnelClient>,
    timeout: Duration,
    slots: Mutex<HashMap<PackageId, TunnelSlot>>,
}

impl TunnelManager {
    pub fn new(client: Arc<dyn TunnelClient>, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &str {
        self.client.name()
    }

    pub fn available(&self) -> bool {
        self.client.available()
    }

    fn slot(&self, package: &PackageId) -> TunnelSlot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(package.clone()).or_default())
    }

    /// Open a tunnel to `127.0.0.1:<port>` for run attempt `owner`, or return
    /// the one that attempt already has. A tunnel left over from an earlier
    /// attempt is closed first. The flag is true when a new tunnel was created.
    pub async fn open(
        &self,
        package: &PackageId,
        port: u16,
        owner: u64,
    ) -> Result<(TunnelInfo, bool), CoreError> {
        let slot = self.slot(package);
        let mut active = slot.lock().await;
        match active.take() {
            Some(existing) if existing.owner == owner => {
                let info = existing.info.clone();
                *active = Some(existing);
                return Ok((info, false));
            }
            Some(stale) => {
                info!("[{package}] replacing stale tunnel {}", stale.info.url);
                if let Err(e) = self.client.close(stale.handle).await {
                    warn!("[{package}] {e}");
                }
            }
            None => {}
        }

        // The client enforces `timeout` itself; this only guards against a
        // client that never returns.
        let backstop = self.timeout.saturating_mul(2);
        let handle = match tokio::time::timeout(backstop, self.client.open(package, port)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(CoreError::TunnelUnavailable(e.to_string())),
            Err(_) => {
                return Err(CoreError::TunnelUnavailable(format!(
                    "{} did not answer within {backstop:?}",
                    self.client.name()
                )))
            }
        };
        let info = TunnelInfo {
            url: handle.url().to_owned(),
            established_at: chrono::Utc::now().to_rfc3339(),
        };
        info!("[{package}] tunnel open at {}", info.url);
        *active = Some(ActiveTunnel {
            handle,
            info: info.clone(),
            owner,
        });
        Ok((info, true))
    }

    /// Tear down the package's tunnel. False if none was open.
    pub async fn close(&self, package: &PackageId) -> Result<bool, CoreError> {
        self.close_where(package, |_| true).await
    }

    /// Tear down the package's tunnel only if run attempt `owner` opened it.
    pub async fn close_owned(&self, package: &PackageId, owner: u64) -> Result<bool, CoreError> {
        self.close_where(package, |a| a.owner == owner).await
    }

    async fn close_where(
        &self,
        package: &PackageId,
        owned: impl Fn(&ActiveTunnel) -> bool,
    ) -> Result<bool, CoreError> {
        let slot = self.slot(package);
        let active = {
            let mut guard = slot.lock().await;
            match guard.take() {
                Some(active) if owned(&active) => active,
                other => {
                    *guard = other;
                    return Ok(false);
                }
            }
        };
        info!("[{package}] closing tunnel {}", active.info.url);
        self.client
            .close(active.handle)
            .await
            .map_err(|e| CoreError::TunnelUnavailable(e.to_string()))?;
        Ok(true)
    }

    pub async fn current(&self, package: &PackageId) -> Option<TunnelInfo> {
        let slot = self.slot(package);
        let active = slot.lock().await;
        active.as_ref().map(|a| a.info.clone())
    }

    pub async fn close_all(&self) {
        let packages: Vec<PackageId> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for package in packages {
            if let Err(e) = self.close(&package).await {
                warn!("[{package}] {e}");
            }
        }
    }
}
