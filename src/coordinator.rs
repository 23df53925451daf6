//! Top-level orchestration API (`spec.md` §4.7, C7).
//!
//! Wires the backend driver (C1), process registry (C2), memory
//! accountant (C3), admission queue (C4), and subagent catalog (C6)
//! behind the public contract described in `spec.md` §4.7. The call graph
//! is acyclic (`Coordinator` -> {registry, memory, queue}, never the
//! reverse) and no component holds two locks simultaneously, per
//! `spec.md` §5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{BackendContext, BackendDriver, DispatchDriver};
use crate::error::{CrateError, Result};
use crate::memory::MemoryAccountant;
use crate::model::{Endpoint, Owner, ProcessEntry, Status, SubagentDefinition, Transport, Waiter};
use crate::queue::AdmissionQueue;
use crate::registry::{main_key, subagent_key, ProcessRegistry};

fn transport_for(endpoint: &Endpoint) -> Transport {
    if endpoint.provider.is_hosted() {
        return Transport::HostedNoop;
    }
    match endpoint.server.as_ref().map(crate::model::ServerDescriptor::kind) {
        None | Some(crate::model::ServerKind::Local) => Transport::LocalExec,
        Some(crate::model::ServerKind::Remote) => Transport::RemoteSshExec,
        Some(crate::model::ServerKind::Docker) => {
            let is_remote = matches!(
                endpoint.server,
                Some(crate::model::ServerDescriptor::Docker(crate::model::DockerDescriptor { host: Some(_), .. }))
            );
            if is_remote {
                Transport::RemoteDocker
            } else {
                Transport::LocalDocker
            }
        }
    }
}

/// The top-level API described by `spec.md` §4.7.
pub struct Coordinator {
    registry: ProcessRegistry,
    memory: Arc<MemoryAccountant>,
    queue: AdmissionQueue,
    backend_ctx: Arc<BackendContext>,
    definitions: AsyncMutex<HashMap<String, SubagentDefinition>>,
    /// run_id -> subagent id, so `stopSubagentBackend` can look the
    /// definition back up without the caller re-supplying it. `Arc`-wrapped
    /// so the delayed-stop timer task can prune its own entry once it
    /// finishes, the same as `stop_subagent_backend_now` does synchronously.
    run_subagent: Arc<AsyncMutex<HashMap<String, String>>>,
    /// Pending delayed-stop timers (`spec.md` §4.7, `unloadDelayMs`),
    /// keyed by run id. Wrapped in `AbortOnDropHandle` (the host project's
    /// own pattern for detached background tasks, e.g.
    /// `commands::handler`) so a forced `stopAll` can cancel a still-
    /// waiting timer outright instead of letting it fire pointlessly
    /// against an already-removed entry. `Arc`-wrapped for the same reason
    /// as `run_subagent`.
    delayed_stops: Arc<AsyncMutex<HashMap<String, AbortOnDropHandle<()>>>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(memory: Arc<MemoryAccountant>, backend_ctx: Arc<BackendContext>) -> Self {
        Coordinator {
            registry: ProcessRegistry::new(),
            memory,
            queue: AdmissionQueue::new(),
            backend_ctx,
            definitions: AsyncMutex::new(HashMap::new()),
            run_subagent: Arc::new(AsyncMutex::new(HashMap::new())),
            delayed_stops: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    /// Registers (or replaces) a subagent definition the coordinator
    /// resolves endpoints from. A thin substitute for holding a live
    /// reference to `catalog::SubagentCatalog`, so the coordinator doesn't
    /// need to know about file persistence.
    pub async fn register_definition(&self, definition: SubagentDefinition) {
        self.definitions.lock().await.insert(definition.id.clone(), definition);
    }

    async fn driver_for(&self, endpoint: &Endpoint) -> DispatchDriver {
        DispatchDriver::for_endpoint(endpoint, Arc::clone(&self.backend_ctx))
    }

    /// `startMainBackend(endpoint) -> baseURL` (`spec.md` §4.7). Idempotent
    /// and persistent: never stops except via forced shutdown.
    pub async fn start_main_backend(&self, model_id: &str, endpoint: Endpoint) -> Result<Url> {
        let key = main_key(model_id);

        let _lock = self.registry.acquire_start_lock(&key).await;
        if let Some(entry) = self.registry.get(&key).await {
            if entry.is_running() {
                return Ok(endpoint_base_url(&entry));
            }
        }

        let fraction = endpoint.reserved_fraction();
        if !self.memory.can_use(&endpoint, fraction) {
            return Err(CrateError::ConfigInvalid {
                key: key.clone(),
                reason: "main backend does not fit within the effective memory cap".to_string(),
            });
        }
        self.memory.add(&endpoint, fraction);

        let transport = transport_for(&endpoint);
        let mut entry = ProcessEntry::new(Owner::Main, endpoint.clone(), transport);
        self.registry.put(key.clone(), entry.clone()).await;

        let driver = self.driver_for(&endpoint).await;
        match driver.start(&key, &endpoint).await {
            Ok(outcome) => {
                entry.status = Status::Running;
                entry.pid = outcome.pid;
                entry.container_id = outcome.container_id;
                self.registry.put(key.clone(), entry).await;
                info!(key = %key, base_url = %outcome.base_url, "main backend running");
                Ok(outcome.base_url)
            }
            Err(e) => {
                self.memory.subtract(&endpoint, fraction);
                self.registry.remove(&key).await;
                Err(e)
            }
        }
    }

    /// `startSubagentBackend(runId, label, endpoint) -> baseURL` (`spec.md`
    /// §4.7). Implements the start-path ordering of §4.7 exactly.
    pub async fn start_subagent_backend(&self, run_id: &str, subagent_id: &str, endpoint: Endpoint) -> Result<Option<Url>> {
        // Hosted providers need no process at all.
        if endpoint.provider.is_hosted() && endpoint.server.is_none() {
            let driver = self.driver_for(&endpoint).await;
            let key = subagent_key(run_id);
            let outcome = driver.start(&key, &endpoint).await?;
            return Ok(Some(outcome.base_url));
        }

        let auto_load = self
            .definitions
            .lock()
            .await
            .get(subagent_id)
            .map_or(true, |d| d.behavior.auto_load);
        if !auto_load {
            return Ok(None);
        }

        let model_key = endpoint.model_key();
        let fraction = endpoint.reserved_fraction();

        loop {
            let key = subagent_key(run_id);
            let lock = self.registry.acquire_start_lock(&key).await;

            // Double-checked admission (`spec.md` §4.7, step 2): an
            // existing running entry for this exact run id short-circuits.
            if let Some(entry) = self.registry.get(&key).await {
                if entry.is_running() {
                    self.run_subagent.lock().await.insert(run_id.to_string(), subagent_id.to_string());
                    return Ok(Some(endpoint_base_url(&entry)));
                }
            }

            // Is some other entry already serving this exact model key?
            let occupying = self
                .registry
                .list_all()
                .await
                .into_iter()
                .find(|(_, e)| e.is_running() && e.endpoint.model_key() == model_key);

            if let Some((_, entry)) = occupying {
                self.run_subagent.lock().await.insert(run_id.to_string(), subagent_id.to_string());
                return Ok(Some(endpoint_base_url(&entry)));
            }

            if !self.memory.can_use(&endpoint, fraction) {
                drop(lock);
                let (waiter, rx) = Waiter::new(run_id, subagent_id, model_key.clone(), fraction);
                // `startSubagentBackend`'s public signature (`spec.md` §4.7)
                // carries no separate session id, only `runId`; parking by
                // `runId` degenerates each "session" to its own waiter,
                // documented as the resolved choice in `DESIGN.md`.
                self.queue.park(run_id, waiter).await;
                rx.await.map_err(|_| CrateError::WaiterCancelled {
                    run_id: run_id.to_string(),
                    reason: "admission channel closed".to_string(),
                })??;
                // Woken: retry the whole admission sequence, since the
                // slot landscape may have changed while parked.
                continue;
            }

            self.memory.add(&endpoint, fraction);

            let transport = transport_for(&endpoint);
            let mut entry = ProcessEntry::new(Owner::Subagent, endpoint.clone(), transport);
            self.registry.put(key.clone(), entry.clone()).await;

            let driver = self.driver_for(&endpoint).await;
            return match driver.start(&key, &endpoint).await {
                Ok(outcome) => {
                    entry.status = Status::Running;
                    entry.pid = outcome.pid;
                    entry.container_id = outcome.container_id;
                    self.registry.put(key.clone(), entry).await;
                    self.run_subagent.lock().await.insert(run_id.to_string(), subagent_id.to_string());
                    debug!(run_id, base_url = %outcome.base_url, "subagent backend running");
                    Ok(Some(outcome.base_url))
                }
                Err(e) => {
                    self.memory.subtract(&endpoint, fraction);
                    self.registry.remove(&key).await;
                    Err(e)
                }
            };
        }
    }

    /// `stopSubagentBackend(runId)` (`spec.md` §4.7). No-op success if
    /// absent; refuses (returns `false`) for persistent or main-owned
    /// entries.
    pub async fn stop_subagent_backend(&self, run_id: &str) -> Result<bool> {
        let subagent_id = self.run_subagent.lock().await.get(run_id).cloned();
        let unload_delay_ms = match &subagent_id {
            Some(id) => self
                .definitions
                .lock()
                .await
                .get(id)
                .map(|d| d.behavior.unload_delay_ms)
                .unwrap_or(0),
            None => 0,
        };

        if unload_delay_ms > 0 {
            self.schedule_delayed_stop(run_id, unload_delay_ms).await;
            return Ok(true);
        }

        self.stop_subagent_backend_now(run_id).await
    }

    async fn schedule_delayed_stop(&self, run_id: &str, delay_ms: u64) {
        // `spec.md` §4.7: "the coordinator returns immediately" when a
        // delayed stop is scheduled.
        let run_id_key = run_id.to_string();
        let run_id = run_id.to_string();
        let registry = self.registry.clone();
        let memory = Arc::clone(&self.memory);
        let backend_ctx = Arc::clone(&self.backend_ctx);
        let queue = self.queue.clone();
        let run_subagent = Arc::clone(&self.run_subagent);
        let delayed_stops = Arc::clone(&self.delayed_stops);

        let handle = AbortOnDropHandle::new(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let key = subagent_key(&run_id);
            if let Some(entry) = registry.get(&key).await {
                if entry.owner == Owner::Subagent {
                    let driver = DispatchDriver::for_endpoint(&entry.endpoint, backend_ctx);
                    if let Err(e) = driver.stop(&entry).await {
                        warn!(run_id = %run_id, error = %e, "delayed stop failed, relying on health probing");
                    }
                    memory.subtract(&entry.endpoint, entry.endpoint.reserved_fraction());
                    registry.remove(&key).await;
                    queue.wake_one(&occupied_model_keys(&registry).await).await;
                }
            }
            // Prune the bookkeeping this very timer is listed under, the
            // same cleanup `stop_subagent_backend_now` does synchronously
            // — otherwise a completed delayed stop leaves a stale
            // `run_subagent` mapping and a finished handle behind forever.
            run_subagent.lock().await.remove(&run_id);
            delayed_stops.lock().await.remove(&run_id);
        }));

        self.delayed_stops.lock().await.insert(run_id_key, handle);
    }

    async fn stop_subagent_backend_now(&self, run_id: &str) -> Result<bool> {
        let key = subagent_key(run_id);
        let Some(entry) = self.registry.get(&key).await else {
            return Ok(true);
        };

        if entry.is_persistent_owner() {
            return Ok(false);
        }

        self.registry.update(&key, |e| e.status = Status::Stopping).await;
        debug!(run_id, status = %Status::Stopping, "subagent backend stopping");

        let driver = self.driver_for(&entry.endpoint).await;
        if let Err(e) = driver.stop(&entry).await {
            warn!(run_id, error = %e, "stop failed, relying on health probing to detect it");
        }

        self.memory.subtract(&entry.endpoint, entry.endpoint.reserved_fraction());
        self.registry.remove(&key).await;
        self.run_subagent.lock().await.remove(run_id);
        self.delayed_stops.lock().await.remove(run_id);

        self.queue.wake_one(&occupied_model_keys(&self.registry).await).await;
        Ok(true)
    }

    /// `stopAll(force)` (`spec.md` §4.7). Skips `main` owners unless
    /// `force`; per the resolved open question in `DESIGN.md`, forced
    /// shutdown of persistent entries happens synchronously. Any pending
    /// delayed-stop timer is aborted rather than left to fire later
    /// against an entry this call already tore down.
    pub async fn stop_all(&self, force: bool) -> Result<()> {
        self.delayed_stops.lock().await.clear();

        for (key, entry) in self.registry.list_all().await {
            if entry.owner == Owner::Main && !force {
                continue;
            }

            let driver = self.driver_for(&entry.endpoint).await;
            if let Err(e) = driver.stop(&entry).await {
                warn!(key = %key, error = %e, "stop_all: stop failed, continuing shutdown");
            }
            self.memory.subtract(&entry.endpoint, entry.endpoint.reserved_fraction());
            self.registry.remove(&key).await;
        }
        Ok(())
    }

    pub async fn status(&self, run_id: &str) -> Option<Status> {
        self.registry.get(&subagent_key(run_id)).await.map(|e| e.status)
    }

    pub async fn base_url_of(&self, run_id: &str) -> Option<Url> {
        self.registry.get(&subagent_key(run_id)).await.map(|e| endpoint_base_url(&e))
    }

    pub async fn is_running(&self, run_id: &str) -> bool {
        self.registry.get(&subagent_key(run_id)).await.is_some_and(|e| e.is_running())
    }

    pub async fn can_stop(&self, run_id: &str) -> bool {
        match self.registry.get(&subagent_key(run_id)).await {
            Some(entry) => !entry.is_persistent_owner(),
            None => true,
        }
    }

    /// Cancels a still-queued waiter (`spec.md` §4.4, "Cancellation").
    pub async fn cancel_pending(&self, run_id: &str) -> bool {
        self.queue.cancel(run_id, "caller cancelled").await
    }

    /// Rejects every waiter for `session_id` (`spec.md` §4.4, "Session
    /// teardown").
    pub async fn teardown_session(&self, session_id: &str) {
        self.queue.teardown_session(session_id).await;
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryAccountant {
        &self.memory
    }

    #[must_use]
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }
}

async fn occupied_model_keys(registry: &ProcessRegistry) -> Vec<String> {
    registry
        .list_all()
        .await
        .into_iter()
        .filter(|(_, e)| e.is_running())
        .map(|(_, e)| e.endpoint.model_key())
        .collect()
}

fn endpoint_base_url(entry: &ProcessEntry) -> Url {
    entry.endpoint.base_url.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchitectureKind, Config};
    use crate::model::{Provider, ResourceHints};
    use std::str::FromStr;

    fn endpoint(url: &str, fraction: f64) -> Endpoint {
        Endpoint {
            provider: Provider::OpenAi,
            base_url: Url::parse(url).unwrap(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            server: None,
            resource_hints: ResourceHints {
                gpu_memory_utilization: Some(fraction),
                ..Default::default()
            },
        }
    }

    fn coordinator() -> Coordinator {
        let config = Config::from_str("").unwrap();
        let memory = Arc::new(MemoryAccountant::new(ArchitectureKind::LocalGpu, &config));
        let ctx = Arc::new(BackendContext::default());
        Coordinator::new(memory, ctx)
    }

    /// Binds a loopback listener that answers every request with `200 OK`,
    /// standing in for a hosted provider's readiness endpoint so
    /// `HostedDriver::start`'s health probe succeeds without reaching the
    /// network. Returns the bound port; the accept loop runs until the test
    /// process exits.
    async fn spawn_stub_health_server() -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn hosted_provider_with_no_server_needs_no_process_entry() {
        let coordinator = coordinator();
        let port = spawn_stub_health_server().await;
        let endpoint = endpoint(&format!("http://127.0.0.1:{port}/v1"), 1.0);

        let url = coordinator
            .start_subagent_backend("run-1", "coder", endpoint.clone())
            .await
            .unwrap();

        assert_eq!(url, Some(endpoint.base_url));
        assert!(coordinator.registry.list_all().await.is_empty());
        assert!((coordinator.memory.usage(&endpoint) - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stop_on_absent_entry_succeeds() {
        let coordinator = coordinator();
        assert!(coordinator.stop_subagent_backend("never-started").await.unwrap());
    }

    #[tokio::test]
    async fn stop_all_skips_main_without_force() {
        let coordinator = coordinator();
        coordinator
            .registry
            .put(
                main_key("m1"),
                ProcessEntry {
                    status: Status::Running,
                    ..ProcessEntry::new(Owner::Main, endpoint("https://api.openai.com/v1", 1.0), Transport::HostedNoop)
                },
            )
            .await;

        coordinator.stop_all(false).await.unwrap();
        assert!(coordinator.registry.get(&main_key("m1")).await.is_some());

        coordinator.stop_all(true).await.unwrap();
        assert!(coordinator.registry.get(&main_key("m1")).await.is_none());
    }

    #[tokio::test]
    async fn auto_load_false_returns_none_without_side_effects() {
        let coordinator = coordinator();
        coordinator
            .register_definition(SubagentDefinition {
                id: "coder".to_string(),
                name: "Coder".to_string(),
                description: String::new(),
                metadata: crate::model::Metadata::default(),
                personality: None,
                model: crate::model::ModelBinding {
                    endpoint: endpoint("http://127.0.0.1:8001/v1", 0.5),
                    fallback_endpoints: vec![],
                    max_retries: 2,
                },
                behavior: crate::model::Behavior {
                    auto_load: false,
                    ..Default::default()
                },
            })
            .await;

        let mut ep = endpoint("http://127.0.0.1:8001/v1", 0.5);
        ep.provider = Provider::Vllm;
        let result = coordinator.start_subagent_backend("run-1", "coder", ep).await.unwrap();
        assert_eq!(result, None);
        assert!(coordinator.registry.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn stop_all_cancels_pending_delayed_stop_timer() {
        let coordinator = coordinator();
        let mut ep = endpoint("http://127.0.0.1:8001/v1", 0.5);
        ep.provider = Provider::Vllm;
        let key = subagent_key("run-1");
        coordinator
            .registry
            .put(
                key.clone(),
                ProcessEntry {
                    status: Status::Running,
                    ..ProcessEntry::new(Owner::Subagent, ep.clone(), Transport::LocalExec)
                },
            )
            .await;
        coordinator.memory.add(&ep, 0.5);

        // Long enough that the timer body never fires during the test.
        coordinator.schedule_delayed_stop("run-1", 60_000).await;
        assert!(coordinator.delayed_stops.lock().await.contains_key("run-1"));

        coordinator.stop_all(true).await.unwrap();

        assert!(coordinator.delayed_stops.lock().await.is_empty());
        assert!(coordinator.registry.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn stop_now_cancels_its_own_pending_delayed_stop() {
        let coordinator = coordinator();
        let mut ep = endpoint("http://127.0.0.1:8001/v1", 0.5);
        ep.provider = Provider::Vllm;
        let key = subagent_key("run-1");
        coordinator
            .registry
            .put(
                key.clone(),
                ProcessEntry {
                    status: Status::Running,
                    ..ProcessEntry::new(Owner::Subagent, ep.clone(), Transport::LocalExec)
                },
            )
            .await;
        coordinator.memory.add(&ep, 0.5);
        coordinator.schedule_delayed_stop("run-1", 60_000).await;

        assert!(coordinator.stop_subagent_backend_now("run-1").await.unwrap());
        assert!(coordinator.delayed_stops.lock().await.is_empty());
    }

    #[tokio::test]
    async fn delayed_stop_prunes_run_subagent_and_its_own_timer_entry_once_it_fires() {
        let coordinator = coordinator();
        let mut ep = endpoint("http://127.0.0.1:8001/v1", 0.5);
        ep.provider = Provider::Vllm;
        let key = subagent_key("run-1");
        coordinator
            .registry
            .put(
                key.clone(),
                ProcessEntry {
                    status: Status::Running,
                    ..ProcessEntry::new(Owner::Subagent, ep.clone(), Transport::LocalExec)
                },
            )
            .await;
        coordinator.memory.add(&ep, 0.5);
        coordinator.run_subagent.lock().await.insert("run-1".to_string(), "coder".to_string());

        coordinator.schedule_delayed_stop("run-1", 1).await;

        // Give the spawned timer task time to fire and prune behind it.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(coordinator.registry.get(&key).await.is_none());
        assert!(!coordinator.run_subagent.lock().await.contains_key("run-1"));
        assert!(coordinator.delayed_stops.lock().await.is_empty());
    }
}
