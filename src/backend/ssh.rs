use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::error::{CrateError, RegistryKey, Result};
use crate::model::{Endpoint, ProcessEntry, ServerDescriptor, SshAuth, SshDescriptor};

use super::driver::{launch_failed, BackendContext, BackendDriver, LaunchOutcome};
use super::health::check_health;
use super::local::build_argv;

const SSH_CONNECT_TIMEOUT_SECS: u64 = 30;
const SSH_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Launches `vllm`/`sglang` on a remote host over SSH (`spec.md` §4.1,
/// "Remote-SSH-exec").
///
/// Shells out to the system `ssh` binary rather than a dedicated SSH
/// protocol library: the spec's own description of this transport is CLI
/// shaped (`nohup ... &`, echoing a PID, `kill <pid>` to stop), which maps
/// directly onto subprocess invocation.
pub struct SshExecDriver {
    ctx: Arc<BackendContext>,
}

impl SshExecDriver {
    #[must_use]
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        SshExecDriver { ctx }
    }
}

fn ssh_base_args(ssh: &SshDescriptor) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        ssh.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"),
    ];

    if let SshAuth::KeyPath { path } = &ssh.auth {
        args.push("-i".to_string());
        args.push(path.display().to_string());
    }

    args.push(format!("{}@{}", ssh.user, ssh.host));
    args
}

fn ssh_command(ssh: &SshDescriptor) -> Command {
    match &ssh.auth {
        SshAuth::Password { secret } => {
            let mut cmd = Command::new("sshpass");
            cmd.arg("-p").arg(secret.expose_secret());
            cmd.arg("ssh");
            cmd
        }
        SshAuth::KeyPath { .. } => Command::new("ssh"),
    }
}

pub(super) async fn run_remote(ssh: &SshDescriptor, remote_command: &str) -> std::io::Result<std::process::Output> {
    let mut cmd = ssh_command(ssh);
    cmd.args(ssh_base_args(ssh));
    cmd.arg(remote_command);
    cmd.output().await
}

#[async_trait]
impl BackendDriver for SshExecDriver {
    async fn start(&self, key: &RegistryKey, endpoint: &Endpoint) -> Result<LaunchOutcome> {
        let Some(ServerDescriptor::Remote { ssh, command, args, env }) = &endpoint.server else {
            return Err(launch_failed(
                key,
                "remote-ssh-exec",
                anyhow::anyhow!("endpoint has no remote server descriptor"),
            ));
        };

        let port = endpoint
            .resource_hints
            .port
            .unwrap_or(self.ctx.allocate_port(endpoint.provider).await);

        let launch_args = if args.is_empty() {
            build_argv(&endpoint.model, port, &endpoint.resource_hints)
        } else {
            args.clone()
        };

        let log_path = format!("/tmp/modelpool-{key}.log");
        let env_prefix: String = env
            .iter()
            .map(|(k, v)| format!("{k}={v} "))
            .collect::<Vec<_>>()
            .concat();
        let remote_command = format!(
            "{env_prefix}nohup {command} {} > {log_path} 2>&1 & echo $!",
            launch_args.join(" ")
        );

        debug!(key = %key, host = %ssh.host, "launching backend over ssh");

        let output = timeout(
            Duration::from_secs(SSH_COMMAND_TIMEOUT_SECS),
            run_remote(ssh, &remote_command),
        )
        .await
        .map_err(|_| {
            CrateError::SshFailed {
                host: ssh.host.clone(),
                port: ssh.port,
                source: anyhow::anyhow!("ssh command timed out after {SSH_COMMAND_TIMEOUT_SECS}s"),
            }
        })?
        .map_err(|e| CrateError::SshFailed {
            host: ssh.host.clone(),
            port: ssh.port,
            source: e.into(),
        })?;

        if !output.status.success() {
            return Err(CrateError::SshFailed {
                host: ssh.host.clone(),
                port: ssh.port,
                source: anyhow::anyhow!(
                    "ssh exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }

        let pid: u32 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|e| launch_failed(key, "remote-ssh-exec", anyhow::anyhow!("could not parse remote pid: {e}")))?;

        let base_url = Url::parse(&format!("http://{}:{port}/", ssh.host)).expect("valid remote url");

        let healthy = check_health(&self.ctx.http_client, endpoint.provider, &base_url, self.ctx.health_check_timeout).await;
        if !healthy {
            let _ = run_remote(ssh, &format!("kill {pid}")).await;
            return Err(CrateError::HealthTimeout {
                key: key.clone(),
                timeout_secs: self.ctx.health_check_timeout.as_secs(),
            });
        }

        Ok(LaunchOutcome {
            base_url,
            pid: Some(pid),
            container_id: None,
        })
    }

    async fn stop(&self, entry: &ProcessEntry) -> Result<()> {
        let (Some(ServerDescriptor::Remote { ssh, .. }), Some(pid)) = (&entry.endpoint.server, entry.pid) else {
            return Ok(());
        };

        if let Err(e) = run_remote(ssh, &format!("kill {pid}")).await {
            warn!(host = %ssh.host, pid, error = %e, "failed to signal remote process, relying on health probing to detect it");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn base_args_include_connect_timeout_and_key_path() {
        let ssh = SshDescriptor {
            host: "10.0.0.5".to_string(),
            port: 22,
            user: "root".to_string(),
            auth: SshAuth::KeyPath {
                path: PathBuf::from("/home/user/.ssh/id_ed25519"),
            },
            workdir: None,
        };
        let args = ssh_base_args(&ssh);
        assert!(args.contains(&"-i".to_string()));
        assert!(args.iter().any(|a| a.contains("ConnectTimeout")));
        assert!(args.contains(&"root@10.0.0.5".to_string()));
    }
}
