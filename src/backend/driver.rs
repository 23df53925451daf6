use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use url::Url;

use crate::error::{CrateError, RegistryKey, Result};
use crate::model::{Endpoint, ProcessEntry, Provider, ServerKind};

use super::docker::{LocalDockerDriver, RemoteDockerDriver};
use super::hosted::HostedDriver;
use super::local::LocalExecDriver;
use super::port::PortAllocator;
use super::ssh::SshExecDriver;

/// The result of a successful [`BackendDriver::start`]: the base URL a
/// caller can now reach the backend at, plus whatever handle the
/// transport needs to stop it later.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub base_url: Url,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
}

/// Shared resources handed to every concrete driver: the pooled HTTP
/// client used for health probing, a port allocator per provider, and the
/// timeouts governing launch and shutdown (`spec.md` §4.1).
pub struct BackendContext {
    pub http_client: reqwest::Client,
    pub health_check_timeout: Duration,
    pub shutdown_timeout: Duration,
    port_allocators: Mutex<HashMap<Provider, Arc<PortAllocator>>>,
}

impl BackendContext {
    #[must_use]
    pub fn new(health_check_timeout: Duration, shutdown_timeout: Duration) -> Self {
        BackendContext {
            http_client: reqwest::Client::new(),
            health_check_timeout,
            shutdown_timeout,
            port_allocators: Mutex::new(HashMap::new()),
        }
    }

    pub async fn allocate_port(&self, provider: Provider) -> u16 {
        let mut guard = self.port_allocators.lock().await;
        let allocator = guard
            .entry(provider)
            .or_insert_with(|| Arc::new(PortAllocator::for_provider(provider)));
        allocator.next_port().await
    }
}

impl Default for BackendContext {
    fn default() -> Self {
        BackendContext::new(Duration::from_secs(30), Duration::from_secs(15))
    }
}

/// Translates an endpoint + server descriptor into a running, healthy
/// backend, and later tears it down (`spec.md` §4.1, C1).
#[async_trait]
pub trait BackendDriver: Send + Sync {
    async fn start(&self, key: &RegistryKey, endpoint: &Endpoint) -> Result<LaunchOutcome>;

    /// Idempotent: stopping an already-stopped backend is not an error.
    /// Failures here are logged by the caller and swallowed, since the
    /// caller relies on subsequent health probing to detect anomalies
    /// (`spec.md` §4.1, `stop`).
    async fn stop(&self, entry: &ProcessEntry) -> Result<()>;
}

/// Picks the concrete driver implied by an endpoint's provider and server
/// descriptor, and dispatches to it.
pub enum DispatchDriver {
    Hosted(HostedDriver),
    LocalExec(LocalExecDriver),
    SshExec(SshExecDriver),
    LocalDocker(LocalDockerDriver),
    RemoteDocker(RemoteDockerDriver),
}

impl DispatchDriver {
    #[must_use]
    pub fn for_endpoint(endpoint: &Endpoint, ctx: Arc<BackendContext>) -> Self {
        if endpoint.provider.is_hosted() {
            return DispatchDriver::Hosted(HostedDriver::new(ctx));
        }

        match endpoint.server.as_ref().map(crate::model::ServerDescriptor::kind) {
            None | Some(ServerKind::Local) => DispatchDriver::LocalExec(LocalExecDriver::new(ctx)),
            Some(ServerKind::Remote) => DispatchDriver::SshExec(SshExecDriver::new(ctx)),
            Some(ServerKind::Docker) => {
                let is_remote = matches!(
                    endpoint.server,
                    Some(crate::model::ServerDescriptor::Docker(crate::model::DockerDescriptor {
                        host: Some(_),
                        ..
                    }))
                );
                if is_remote {
                    DispatchDriver::RemoteDocker(RemoteDockerDriver::new(ctx))
                } else {
                    DispatchDriver::LocalDocker(LocalDockerDriver::new(ctx))
                }
            }
        }
    }
}

#[async_trait]
impl BackendDriver for DispatchDriver {
    async fn start(&self, key: &RegistryKey, endpoint: &Endpoint) -> Result<LaunchOutcome> {
        match self {
            DispatchDriver::Hosted(d) => d.start(key, endpoint).await,
            DispatchDriver::LocalExec(d) => d.start(key, endpoint).await,
            DispatchDriver::SshExec(d) => d.start(key, endpoint).await,
            DispatchDriver::LocalDocker(d) => d.start(key, endpoint).await,
            DispatchDriver::RemoteDocker(d) => d.start(key, endpoint).await,
        }
    }

    async fn stop(&self, entry: &ProcessEntry) -> Result<()> {
        match self {
            DispatchDriver::Hosted(d) => d.stop(entry).await,
            DispatchDriver::LocalExec(d) => d.stop(entry).await,
            DispatchDriver::SshExec(d) => d.stop(entry).await,
            DispatchDriver::LocalDocker(d) => d.stop(entry).await,
            DispatchDriver::RemoteDocker(d) => d.stop(entry).await,
        }
    }
}

pub(crate) fn launch_failed(key: &RegistryKey, transport: &'static str, source: anyhow::Error) -> CrateError {
    CrateError::LaunchFailed {
        key: key.clone(),
        transport,
        source,
    }
}
