//! Crate-wide error types.
//!
//! Component-local errors (`HypervisorError`, `AclError`, `SessionError`) are
//! `thiserror` enums so callers can match on a specific failure shape; the
//! orchestration and CLI layers collapse everything into `anyhow::Result`.

use thiserror::Error;

/// A subprocess exited non-zero. Callers that need to propagate the exact
/// exit code (rather than just "it failed") match on this variant instead of
/// stringifying the error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("process exited with code {code}")]
pub struct ExitError {
    pub code: i32,
}

impl ExitError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    /// SIGINT/SIGKILL/SIGTERM surfacing from an interactive exec are normal
    /// termination, not failure, per the interactive-runner contract.
    pub fn is_benign(&self) -> bool {
        matches!(self.code, 130 | 137 | 143)
    }
}

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("hypervisor executable not found on PATH (looked for `{0}`)")]
    NotFound(String),

    #[error(transparent)]
    Exit(#[from] ExitError),

    #[error("failed to parse hypervisor output: {0}")]
    Parse(String),

    #[error("io error running hypervisor command: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("no free slot in [1, {max_slots}] for workspace hash {hash}")]
    NoFreeSlot { hash: String, max_slots: u32 },

    /// The slot allocator claimed a slot was free, but the container manager
    /// found it already running. This is always a bug in the allocator, not
    /// a transient race the caller should retry.
    #[error("bug in slot allocation: container {0} for allocated slot is already running")]
    AllocatorBug(String),
}

#[derive(Debug, Error)]
pub enum AclError {
    #[error(
        "network ACLs are not supported on this hypervisor network (not an OVN network).\n\
         Remediation:\n\
         - run with --network=open to skip egress policy, or\n\
         - configure the hypervisor's network to use the OVN driver"
    )]
    NotSupported,

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("malformed session metadata at {0}")]
    MalformedMetadata(std::path::PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("no domain resolved and no cache was available")]
    NoneResolvedNoCache,

    #[error("resolver error: {0}")]
    Resolve(String),
}
