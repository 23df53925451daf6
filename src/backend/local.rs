use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::error::{CrateError, RegistryKey, Result};
use crate::model::{Endpoint, ProcessEntry, ResourceHints, ServerDescriptor};

use super::driver::{launch_failed, BackendContext, BackendDriver, LaunchOutcome};
use super::health::check_health;

/// Launches `vllm`/`sglang` as a local child process (`spec.md` §4.1,
/// "Local-exec").
pub struct LocalExecDriver {
    ctx: Arc<BackendContext>,
    children: Mutex<Vec<Child>>,
}

impl LocalExecDriver {
    #[must_use]
    pub fn new(ctx: Arc<BackendContext>) -> Self {
        LocalExecDriver {
            ctx,
            children: Mutex::new(Vec::new()),
        }
    }
}

/// Normalizes the launch argv shared between local and SSH exec
/// transports (`spec.md` §4.1).
pub(super) fn build_argv(model: &str, port: u16, hints: &ResourceHints) -> Vec<String> {
    let mut args = vec![
        "serve".to_string(),
        model.to_string(),
        "--host".to_string(),
        "0.0.0.0".to_string(),
        "--port".to_string(),
        port.to_string(),
    ];

    if let Some(util) = hints.gpu_memory_utilization {
        args.push("--gpu-memory-utilization".to_string());
        args.push(util.to_string());
    }
    if let Some(max_len) = hints.max_model_len {
        args.push("--max-model-len".to_string());
        args.push(max_len.to_string());
    }
    if hints.tensor_parallel_size > 1 {
        args.push("--tensor-parallel-size".to_string());
        args.push(hints.tensor_parallel_size.to_string());
    }

    args
}

/// Picks the binary and argv to spawn: a configured `Local` `command`/`args`
/// override when present and non-empty, else the provider's default binary
/// and normalized argv.
fn resolve_launch(endpoint: &Endpoint, local_command: Option<(&str, &[String])>, port: u16) -> (String, Vec<String>) {
    let binary = local_command.map_or_else(|| endpoint.provider.binary_name().to_string(), |(command, _)| command.to_string());
    let args = match local_command {
        Some((_, args)) if !args.is_empty() => args.to_vec(),
        _ => build_argv(&endpoint.model, port, &endpoint.resource_hints),
    };
    (binary, args)
}

#[async_trait]
impl BackendDriver for LocalExecDriver {
    async fn start(&self, key: &RegistryKey, endpoint: &Endpoint) -> Result<LaunchOutcome> {
        let port = endpoint
            .resource_hints
            .port
            .unwrap_or(self.ctx.allocate_port(endpoint.provider).await);

        // A `Local` server descriptor lets a caller override the binary,
        // argv, environment, and working directory; absent one, fall back
        // to the provider's default binary and normalized argv (mirrors
        // `SshExecDriver::start`'s handling of its `Remote` descriptor).
        let local = match &endpoint.server {
            Some(ServerDescriptor::Local { command, args, env, workdir }) => {
                Some((command.as_str(), args.as_slice(), env.as_slice(), workdir.as_deref()))
            }
            _ => None,
        };

        let (binary, args) = resolve_launch(endpoint, local.map(|(command, args, ..)| (command, args)), port);

        debug!(key = %key, binary = %binary, ?args, "spawning local backend");

        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        if let Some((_, _, env, workdir)) = local {
            for (k, v) in env {
                cmd.env(k, v);
            }
            if let Some(workdir) = workdir {
                cmd.current_dir(workdir);
            }
        }

        let mut child = cmd.spawn().map_err(|e| launch_failed(key, "local-exec", e.into()))?;

        let pid = child.id();
        let base_url = Url::parse(&format!("http://127.0.0.1:{port}/")).expect("valid local url");

        let healthy = wait_healthy(&self.ctx, &mut child, endpoint.provider, &base_url).await;

        if !healthy {
            let _ = child.kill().await;
            return Err(CrateError::HealthTimeout {
                key: key.clone(),
                timeout_secs: self.ctx.health_check_timeout.as_secs(),
            });
        }

        self.children.lock().await.push(child);

        Ok(LaunchOutcome {
            base_url,
            pid,
            container_id: None,
        })
    }

    async fn stop(&self, entry: &ProcessEntry) -> Result<()> {
        let Some(pid) = entry.pid else {
            return Ok(());
        };

        send_sigterm(pid);

        let deadline = Instant::now() + self.ctx.shutdown_timeout;
        let mut children = self.children.lock().await;
        if let Some(index) = children.iter().position(|c| c.id() == Some(pid)) {
            loop {
                match children[index].try_wait() {
                    Ok(Some(_)) => {
                        children.remove(index);
                        break;
                    }
                    Ok(None) if Instant::now() >= deadline => {
                        warn!(pid, "forcing kill after graceful shutdown timeout");
                        let _ = children[index].kill().await;
                        children.remove(index);
                        break;
                    }
                    Ok(None) => tokio::time::sleep(Duration::from_millis(100)).await,
                    Err(_) => {
                        children.remove(index);
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn wait_healthy(
    ctx: &BackendContext,
    child: &mut Child,
    provider: crate::model::Provider,
    base_url: &Url,
) -> bool {
    if let Ok(Some(_)) = child.try_wait() {
        return false;
    }
    check_health(&ctx.http_client, provider, base_url, ctx.health_check_timeout).await
}

/// Sends `SIGTERM` to a locally-spawned process. Unsafe only because
/// `libc::kill` is an FFI call; the signal itself is best-effort and
/// failures fall through to the forcible-kill escalation.
#[allow(unsafe_code)]
fn send_sigterm(pid: u32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = pid;
}
