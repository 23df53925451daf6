//! Closed error taxonomy for the orchestration core (see `spec.md` §7).
//!
//! Library-boundary functions return `Result<T, CrateError>`. Internal
//! helpers may still thread `anyhow::Error` through and convert at the
//! module boundary, matching the host project's internal style.

use std::path::PathBuf;

use thiserror::Error;

/// Registry key, e.g. `main:<modelId>` or `subagent:<runId>`.
pub type RegistryKey = String;

#[derive(Debug, Error)]
pub enum CrateError {
    #[error("invalid backend configuration for {key}: {reason}")]
    ConfigInvalid { key: RegistryKey, reason: String },

    #[error("launch failed for {key} ({transport}): {source}")]
    LaunchFailed {
        key: RegistryKey,
        transport: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("ssh operation failed against {host}:{port}: {source}")]
    SshFailed {
        host: String,
        port: u16,
        #[source]
        source: anyhow::Error,
    },

    #[error("docker operation failed for container {container}: {source}")]
    DockerFailed {
        container: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("backend {key} did not become healthy within {timeout_secs}s")]
    HealthTimeout { key: RegistryKey, timeout_secs: u64 },

    #[error("batch contains a dependency cycle among {remaining:?}")]
    CycleInBatch { remaining: Vec<String> },

    #[error("waiter for run {run_id} was cancelled: {reason}")]
    WaiterCancelled { run_id: String, reason: String },

    #[error("subagent definition not found: {id}")]
    UnknownSubagent { id: String },

    #[error("failed to persist catalog at {path:?}: {source}")]
    PersistFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog at {path:?}: {source}")]
    CatalogParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CrateError>;
