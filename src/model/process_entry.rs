use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::endpoint::Endpoint;

/// Who requested this backend be running (`spec.md` §3, GLOSSARY "Owner").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    Main,
    Subagent,
}

/// Lifecycle state of a managed backend (`spec.md` §4.1, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// How the backend's process was actually dispatched — set once at launch
/// and immutable thereafter, independent of [`super::ServerKind`] which
/// describes configuration rather than the realized transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    LocalExec,
    RemoteSshExec,
    LocalDocker,
    RemoteDocker,
    HostedNoop,
}

/// A single registered backend instance (`spec.md` §3, `ProcessEntry`).
///
/// This is the registry's unit of bookkeeping: one entry per running (or
/// starting/stopping) backend, keyed by [`crate::error::RegistryKey`] in
/// [`crate::registry::ProcessRegistry`].
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub owner: Owner,
    pub endpoint: Endpoint,
    pub transport: Transport,
    pub status: Status,
    /// OS process id, when the transport manages one directly (absent for
    /// hosted providers and, after completion, for stopped entries).
    pub pid: Option<u32>,
    /// Container id, set only for [`Transport::LocalDocker`] /
    /// [`Transport::RemoteDocker`].
    pub container_id: Option<String>,
    /// Count of subagent runs currently holding a reference to this
    /// backend; the main owner's entry always holds an implicit one.
    pub refcount: u32,
    pub started_at: Instant,
    /// Set when a delayed stop has been scheduled (`spec.md` §4.7,
    /// `unloadDelayMs`); cleared if a new borrower arrives first.
    pub stop_scheduled: bool,
}

impl ProcessEntry {
    #[must_use]
    pub fn new(owner: Owner, endpoint: Endpoint, transport: Transport) -> Self {
        ProcessEntry {
            owner,
            endpoint,
            transport,
            status: Status::Starting,
            pid: None,
            container_id: None,
            refcount: 1,
            started_at: Instant::now(),
            stop_scheduled: false,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == Status::Running
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status == Status::Stopped
    }

    /// `true` for entries a plain `stopSubagentBackend` must refuse
    /// (`spec.md` §4.7: "a main-owned entry is never stopped by a subagent
    /// request"). Only `stopAll(force: true)` may tear one down.
    #[must_use]
    pub fn is_persistent_owner(&self) -> bool {
        self.owner == Owner::Main
    }
}
