use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::models::{DeviceRequest, HostConfig, PortBinding};
use bollard::Docker;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::error::{CrateError, RegistryKey, Result};
use crate::model::{DockerDescriptor, Endpoint, GpuSelection, ProcessEntry, ServerDescriptor};

use super::driver::{launch_failed, BackendContext, BackendDriver, LaunchOutcome};
use super::health::check_health;
use super::ssh::run_remote;

/// Runs `vllm`/`sglang` as a container against the local Docker daemon
/// (`spec.md` §4.1, "Local-docker"), grounded on the host project's
/// `bollard`-based container lifecycle.
pub struct LocalDockerDriver {
    ctx: Arc<BackendContext>,
    docker: Mutex<Option<Docker>>,
}

impl LocalDockerDriver {
    #[must_use]
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        LocalDockerDriver {
            ctx,
            docker: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Docker> {
        let mut guard = self.docker.lock().await;
        if let Some(docker) = guard.as_ref() {
            return Ok(docker.clone());
        }
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| CrateError::DockerFailed {
                container: "<none>".to_string(),
                source: e.into(),
            })?;
        *guard = Some(docker.clone());
        Ok(docker)
    }
}

fn container_name(key: &RegistryKey) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("modelpool-{sanitized}")
}

/// Appends a random suffix to `container_name`'s deterministic base, so a
/// stale container left behind by a failed `stop` (`docker stop` can fail
/// and is swallowed per `spec.md` §4.1) does not collide with the next
/// launch attempt for the same registry key.
fn unique_container_name(key: &RegistryKey) -> String {
    format!("{}-{}", container_name(key), uuid::Uuid::new_v4())
}

fn build_host_config(descriptor: &DockerDescriptor, host_port: u16) -> HostConfig {
    let mut port_bindings = std::collections::HashMap::new();
    port_bindings.insert(
        format!("{}/tcp", descriptor.container_port),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(host_port.to_string()),
        }]),
    );

    let device_requests = match &descriptor.gpus {
        None => None,
        Some(GpuSelection::All) => Some(vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            count: Some(-1),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]),
        Some(GpuSelection::Devices { ids }) => Some(vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            device_ids: Some(ids.iter().map(ToString::to_string).collect()),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]),
    };

    HostConfig {
        auto_remove: Some(true),
        port_bindings: Some(port_bindings),
        device_requests,
        binds: if descriptor.volumes.is_empty() {
            None
        } else {
            Some(
                descriptor
                    .volumes
                    .iter()
                    .map(|(host, container)| format!("{host}:{container}"))
                    .collect(),
            )
        },
        ..Default::default()
    }
}

#[async_trait]
impl BackendDriver for LocalDockerDriver {
    async fn start(&self, key: &RegistryKey, endpoint: &Endpoint) -> Result<LaunchOutcome> {
        let Some(ServerDescriptor::Docker(descriptor)) = &endpoint.server else {
            return Err(launch_failed(key, "local-docker", anyhow::anyhow!("endpoint has no docker descriptor")));
        };

        let docker = self.client().await?;
        let host_port = endpoint
            .resource_hints
            .port
            .unwrap_or(self.ctx.allocate_port(endpoint.provider).await);

        let env: Vec<String> = descriptor.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let host_config = build_host_config(descriptor, host_port);
        let name = unique_container_name(key);

        let config = ContainerConfig {
            image: Some(descriptor.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        debug!(key = %key, image = %descriptor.image, "creating local docker container");

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let container_id = docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| CrateError::DockerFailed {
                container: name.clone(),
                source: e.into(),
            })?
            .id;

        docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| CrateError::DockerFailed {
                container: container_id.clone(),
                source: e.into(),
            })?;

        let base_url = Url::parse(&format!("http://127.0.0.1:{host_port}/")).expect("valid docker url");

        let healthy = check_health(&self.ctx.http_client, endpoint.provider, &base_url, self.ctx.health_check_timeout).await;
        if !healthy {
            let _ = docker
                .stop_container(&container_id, Some(StopContainerOptions { t: 0 }))
                .await;
            return Err(CrateError::HealthTimeout {
                key: key.clone(),
                timeout_secs: self.ctx.health_check_timeout.as_secs(),
            });
        }

        Ok(LaunchOutcome {
            base_url,
            pid: None,
            container_id: Some(container_id[..12.min(container_id.len())].to_string()),
        })
    }

    async fn stop(&self, entry: &ProcessEntry) -> Result<()> {
        let Some(container_id) = &entry.container_id else {
            return Ok(());
        };

        let docker = self.client().await?;
        if let Err(e) = docker
            .stop_container(container_id, Some(StopContainerOptions { t: 15 }))
            .await
        {
            warn!(container_id = %container_id, error = %e, "failed to stop container gracefully");
        }
        let _ = docker
            .remove_container(container_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await;

        Ok(())
    }
}

/// Runs `vllm`/`sglang` as a container against a remote Docker daemon,
/// reached by tunneling the `docker` CLI invocation over SSH rather than
/// bollard (which only speaks to a local or TCP-exposed daemon) —
/// `spec.md` §4.1, "Remote-docker".
pub struct RemoteDockerDriver {
    ctx: Arc<BackendContext>,
}

impl RemoteDockerDriver {
    #[must_use]
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        RemoteDockerDriver { ctx }
    }
}

fn docker_run_argv(descriptor: &DockerDescriptor, container: &str, host_port: u16) -> String {
    let mut parts = vec![
        "docker".to_string(),
        "run".to_string(),
        "--rm".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container.to_string(),
        "-p".to_string(),
        format!("{host_port}:{}", descriptor.container_port),
    ];

    match &descriptor.gpus {
        None => {}
        Some(GpuSelection::All) => {
            parts.push("--gpus".to_string());
            parts.push("all".to_string());
        }
        Some(GpuSelection::Devices { ids }) => {
            let ids = ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
            parts.push("--gpus".to_string());
            parts.push(format!("\"device={ids}\""));
        }
    }

    for (host, container_path) in &descriptor.volumes {
        parts.push("-v".to_string());
        parts.push(format!("{host}:{container_path}"));
    }

    for (k, v) in &descriptor.env {
        parts.push("-e".to_string());
        parts.push(format!("{k}={v}"));
    }

    parts.push(descriptor.image.clone());
    parts.join(" ")
}

#[async_trait]
impl BackendDriver for RemoteDockerDriver {
    async fn start(&self, key: &RegistryKey, endpoint: &Endpoint) -> Result<LaunchOutcome> {
        let Some(ServerDescriptor::Docker(descriptor)) = &endpoint.server else {
            return Err(launch_failed(key, "remote-docker", anyhow::anyhow!("endpoint has no docker descriptor")));
        };
        let Some(ssh) = &descriptor.host else {
            return Err(launch_failed(key, "remote-docker", anyhow::anyhow!("remote docker descriptor has no ssh host")));
        };

        let host_port = endpoint
            .resource_hints
            .port
            .unwrap_or(self.ctx.allocate_port(endpoint.provider).await);
        let container = unique_container_name(key);
        let run_cmd = docker_run_argv(descriptor, &container, host_port);

        debug!(key = %key, host = %ssh.host, "launching docker container over ssh");

        let output = run_remote(ssh, &run_cmd)
            .await
            .map_err(|e| CrateError::SshFailed {
                host: ssh.host.clone(),
                port: ssh.port,
                source: e.into(),
            })?;

        if !output.status.success() {
            return Err(CrateError::DockerFailed {
                container: container.clone(),
                source: anyhow::anyhow!(String::from_utf8_lossy(&output.stderr).to_string()),
            });
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let base_url = Url::parse(&format!("http://{}:{host_port}/", ssh.host)).expect("valid remote docker url");

        let healthy = check_health(&self.ctx.http_client, endpoint.provider, &base_url, self.ctx.health_check_timeout).await;
        if !healthy {
            let _ = run_remote(ssh, &format!("docker stop {container_id}")).await;
            return Err(CrateError::HealthTimeout {
                key: key.clone(),
                timeout_secs: self.ctx.health_check_timeout.as_secs(),
            });
        }

        Ok(LaunchOutcome {
            base_url,
            pid: None,
            container_id: Some(container_id[..12.min(container_id.len())].to_string()),
        })
    }

    async fn stop(&self, entry: &ProcessEntry) -> Result<()> {
        let (Some(ServerDescriptor::Docker(descriptor)), Some(container_id)) = (&entry.endpoint.server, &entry.container_id) else {
            return Ok(());
        };
        let Some(ssh) = &descriptor.host else {
            return Ok(());
        };

        if let Err(e) = run_remote(ssh, &format!("docker stop {container_id}")).await {
            warn!(container_id = %container_id, error = %e, "failed to stop remote container, relying on health probing to detect it");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_sanitizes_registry_key() {
        let key: RegistryKey = "subagent:run-42/foo".to_string();
        assert_eq!(container_name(&key), "modelpool-subagent-run-42-foo");
    }

    #[test]
    fn docker_run_argv_includes_gpu_flag_when_devices_set() {
        let descriptor = DockerDescriptor {
            image: "vllm/vllm-openai:latest".to_string(),
            host: None,
            env: vec![],
            volumes: vec![],
            gpus: Some(GpuSelection::Devices { ids: vec![0, 1] }),
            container_port: 8000,
        };
        let cmd = docker_run_argv(&descriptor, "modelpool-coder", 8001);
        assert!(cmd.contains("--gpus"));
        assert!(cmd.contains("8001:8000"));
    }

    #[test]
    fn docker_run_argv_emits_gpus_all_for_all_selection() {
        let descriptor = DockerDescriptor {
            image: "vllm/vllm-openai:latest".to_string(),
            host: None,
            env: vec![],
            volumes: vec![],
            gpus: Some(GpuSelection::All),
            container_port: 8000,
        };
        let cmd = docker_run_argv(&descriptor, "modelpool-coder", 8001);
        assert!(cmd.contains("--gpus all"));
    }
}
