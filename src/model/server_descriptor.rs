use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::ApiKey;

/// How a backend process is launched and reached (`spec.md` §3, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    /// Launched as a child process on the machine this crate runs on.
    Local,
    /// Launched as a child process on a remote machine reached over SSH.
    Remote,
    /// Launched as a container, local or remote depending on [`DockerDescriptor::host`].
    Docker,
}

/// Authentication for an SSH-reached host (`spec.md` §4.1, "SSH transport").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SshAuth {
    KeyPath { path: PathBuf },
    Password { secret: ApiKey },
}

/// Connection details for a remote host, shared between [`ServerKind::Remote`]
/// exec backends and remote [`DockerDescriptor`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshDescriptor {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
    /// Working directory on the remote host the launch command runs from.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

/// GPU selection for a Docker-launched backend (`spec.md` §3, "GPU device
/// list or \"all\""; §4.1, "`--gpus` (all or specific device list)").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GpuSelection {
    /// `--gpus all`.
    All,
    /// `--gpus "device=<ids>"`, comma-joined.
    Devices { ids: Vec<u32> },
}

/// Docker launch parameters, local or remote (`spec.md` §4.1, "Docker transport").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerDescriptor {
    pub image: String,
    /// `None` runs against the local Docker daemon; `Some` tunnels the
    /// `docker` CLI invocation over SSH to a remote daemon.
    #[serde(default)]
    pub host: Option<SshDescriptor>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub volumes: Vec<(String, String)>,
    /// `None` requests no GPU access at all.
    #[serde(default)]
    pub gpus: Option<GpuSelection>,
    /// Container-internal port the server listens on; mapped to the
    /// allocated host port.
    pub container_port: u16,
}

/// How to start the child process and where it listens, independent of the
/// provider it exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ServerDescriptor {
    Local {
        command: String,
        args: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
        #[serde(default)]
        workdir: Option<PathBuf>,
    },
    Remote {
        ssh: SshDescriptor,
        command: String,
        args: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
    },
    Docker(DockerDescriptor),
}

impl ServerDescriptor {
    #[must_use]
    pub fn kind(&self) -> ServerKind {
        match self {
            ServerDescriptor::Local { .. } => ServerKind::Local,
            ServerDescriptor::Remote { .. } => ServerKind::Remote,
            ServerDescriptor::Docker(_) => ServerKind::Docker,
        }
    }
}
