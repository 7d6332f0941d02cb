//! Process execution and tunnel backends for Pinion.
//!
//! This crate implements the execution layer: the pluggable `ProcessRunner`
//! trait with a host backend (real child processes in their own process
//! group) and a scripted mock backend, the `TunnelClient` trait with
//! cloudflared quick-tunnel and mock backends, and prerequisite checking.

pub mod host;
pub mod mock;
pub mod prereq;
pub mod process;
pub mod runner;
pub mod tunnel;

pub use mock::{MockBehavior, MockRunner};
pub use prereq::{check_host_prereqs, check_tunnel_prereqs, format_missing, MissingPrereq};
pub use process::{
    CommandRole, CommandSpec, ExitInfo, OutputLine, OutputStream, ProcessController,
    ProcessOutput, Signal, SpawnedProcess,
};
pub use runner::{select_runner, ProcessRunner};
pub use tunnel::{
    parse_tunnel_url, select_tunnel_client, BoxFuture, CloudflaredClient, MockTunnelClient,
    TunnelClient, TunnelHandle,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },
    #[error("failed to signal pid {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
    #[error("tunnel failed: {0}")]
    TunnelFailed(String),
    #[error("timed out: {0}")]
    Timeout(String),
}
