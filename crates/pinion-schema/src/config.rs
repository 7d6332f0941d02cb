use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Orchestrator settings, read from `~/.config/pinion/config.toml`.
///
/// Every field has a default, so an empty or missing file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PinionConfig {
    /// Root of the durable state store.
    pub state_dir: PathBuf,
    /// Catalog JSON file. Defaults to `<state_dir>/catalog.json`.
    pub catalog_path: Option<PathBuf>,
    /// Where packages are checked out. Defaults to `<state_dir>/apps`.
    pub apps_dir: Option<PathBuf>,
    /// Process runner backend: `host` or `mock`.
    pub runner: String,
    /// Tunnel backend: `cloudflared` or `mock`.
    pub tunnel_provider: String,
    pub cloudflared_bin: String,
    pub log_tail_lines: usize,
    pub grace_period_ms: u64,
    pub ready_delay_ms: u64,
    pub ready_timeout_ms: u64,
    pub tunnel_timeout_ms: u64,
    pub tunnel_wait_ms: u64,
    pub event_queue_capacity: usize,
    pub store_retries: u32,
    pub bind: String,
}

impl Default for PinionConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            catalog_path: None,
            apps_dir: None,
            runner: "host".to_owned(),
            tunnel_provider: "cloudflared".to_owned(),
            cloudflared_bin: "cloudflared".to_owned(),
            log_tail_lines: 200,
            grace_period_ms: 5_000,
            ready_delay_ms: 2_000,
            ready_timeout_ms: 120_000,
            tunnel_timeout_ms: 30_000,
            tunnel_wait_ms: 10_000,
            event_queue_capacity: 256,
            store_retries: 3,
            bind: "127.0.0.1:8321".to_owned(),
        }
    }
}

impl PinionConfig {
    /// Defaults rooted at `state_dir`, with mock collaborators. Used by tests
    /// and dry runs.
    pub fn for_testing(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            runner: "mock".to_owned(),
            tunnel_provider: "mock".to_owned(),
            grace_period_ms: 500,
            ready_delay_ms: 50,
            ready_timeout_ms: 5_000,
            tunnel_timeout_ms: 2_000,
            tunnel_wait_ms: 2_000,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(input)?;
        config.state_dir = expand_tilde(&config.state_dir.to_string_lossy());
        config.catalog_path = config
            .catalog_path
            .map(|p| expand_tilde(&p.to_string_lossy()));
        config.apps_dir = config.apps_dir.map(|p| expand_tilde(&p.to_string_lossy()));
        config.validate()?;
        Ok(config)
    }

    /// Load `~/.config/pinion/config.toml`, falling back to defaults when the
    /// file does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_tail_lines == 0 {
            return Err(ConfigError::Invalid("log_tail_lines must be > 0".to_owned()));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_queue_capacity must be > 0".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("catalog.json"))
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.apps_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("apps"))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn ready_delay(&self) -> Duration {
        Duration::from_millis(self.ready_delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel_timeout_ms)
    }

    pub fn tunnel_wait(&self) -> Duration {
        Duration::from_millis(self.tunnel_wait_ms)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

fn default_state_dir() -> PathBuf {
    expand_tilde("~/.local/share/pinion")
}

fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/pinion/config.toml"))
}
