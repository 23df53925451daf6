//! End-to-end lifecycle scenarios (`spec.md` §8).
//!
//! Scenarios 1-3 exercise the admission mechanics (C3 memory accountant +
//! C4 admission queue) directly with the spec's literal fractions, since
//! driving them through `Coordinator::start_subagent_backend` would require
//! an actual `vllm` binary on the host. Scenarios 4 and 6 go through the
//! real `Coordinator`, since hosted/main-backend paths need no subprocess.

use std::str::FromStr;
use std::sync::Arc;

use modelpool::backend::BackendContext;
use modelpool::config::{ArchitectureKind, Config};
use modelpool::coordinator::Coordinator;
use modelpool::memory::MemoryAccountant;
use modelpool::model::{Endpoint, Owner, ProcessEntry, Provider, ResourceHints, Status, Transport, Waiter};
use modelpool::queue::AdmissionQueue;
use modelpool::registry::subagent_key;
use url::Url;

fn local_vllm_endpoint(fraction: f64) -> Endpoint {
    Endpoint {
        provider: Provider::Vllm,
        base_url: Url::parse("http://127.0.0.1:8001/v1").unwrap(),
        model: "qwen2.5-7b".to_string(),
        api_key: None,
        server: None,
        resource_hints: ResourceHints {
            gpu_memory_utilization: Some(fraction),
            ..Default::default()
        },
    }
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

async fn hosted_endpoint() -> Endpoint {
    let port = spawn_stub_health_server().await;
    Endpoint {
        provider: Provider::OpenAi,
        base_url: Url::parse(&format!("http://127.0.0.1:{port}/v1")).unwrap(),
        model: "gpt-4o-mini".to_string(),
        api_key: None,
        server: None,
        resource_hints: ResourceHints::default(),
    }
}

fn local_gpu_accountant() -> MemoryAccountant {
    let config = Config::from_str("").unwrap();
    MemoryAccountant::new(ArchitectureKind::LocalGpu, &config)
}

fn coordinator() -> Coordinator {
    let config = Config::from_str("").unwrap();
    let memory = Arc::new(MemoryAccountant::new(ArchitectureKind::LocalGpu, &config));
    let ctx = Arc::new(BackendContext::default());
    Coordinator::new(memory, ctx)
}

#[test_log::test(tokio::test)]
async fn scenarios_1_to_3_admit_reject_then_release_wakes_exactly_one_waiter() {
    // 1. Admit and run one local vLLM subagent: reservation at
    //    ("vllm", "127.0.0.1:8001") becomes 0.8 under a local-gpu cap.
    let accountant = local_gpu_accountant();
    assert!((accountant.effective_cap() - 0.80).abs() < 1e-9);

    let run_1 = local_vllm_endpoint(0.8);
    assert!(accountant.can_use(&run_1, 0.8));
    accountant.add(&run_1, 0.8);
    assert!((accountant.usage(&run_1) - 0.8).abs() < 1e-9);

    // 2. Reject a second start that would exceed the cap: fraction 0.3
    //    cannot be admitted, so its waiter is parked rather than run.
    let run_2 = local_vllm_endpoint(0.3);
    assert!(!accountant.can_use(&run_2, 0.3));

    let queue = AdmissionQueue::new();
    let (waiter, rx) = Waiter::new("run-2", "coder", run_2.model_key(), 0.3);
    queue.park("run-2", waiter).await;
    assert_eq!(queue.len().await, 1);
    assert!((accountant.usage(&run_1) - 0.8).abs() < 1e-9, "reservation must be unchanged by the rejected start");

    // 3. Release wakes exactly one waiter: stopping run-1 frees the
    //    reservation to 0, then admits run-2's parked waiter, whose
    //    reservation becomes 0.3.
    accountant.subtract(&run_1, 0.8);
    assert!((accountant.usage(&run_1) - 0.0).abs() < 1e-9);

    let woken = queue.wake_one(&[]).await;
    assert_eq!(woken.as_deref(), Some("run-2"));
    assert!(rx.await.unwrap().is_ok());
    assert!(queue.is_empty().await);

    accountant.add(&run_2, 0.3);
    assert!((accountant.usage(&run_2) - 0.3).abs() < 1e-9);
}

#[test_log::test(tokio::test)]
async fn scenario_4_main_owned_entry_survives_stop_all_without_force() {
    let coordinator = coordinator();
    let endpoint = hosted_endpoint().await;

    let url = coordinator.start_main_backend("main-model", endpoint.clone()).await.unwrap();
    assert_eq!(url, endpoint.base_url);

    coordinator.stop_all(false).await.unwrap();
    let key = modelpool::registry::main_key("main-model");
    let entry = coordinator.registry().get(&key).await.expect("main entry survives a non-forced stop_all");
    assert!(entry.is_running());

    coordinator.stop_all(true).await.unwrap();
    assert!(coordinator.registry().get(&key).await.is_none(), "forced stop_all tears down main-owned entries too");
}

#[tokio::test]
async fn scenario_6_hosted_provider_requires_no_process() {
    let coordinator = coordinator();
    let endpoint = hosted_endpoint().await;

    let url = coordinator
        .start_subagent_backend("run-hosted", "coder", endpoint.clone())
        .await
        .unwrap();

    assert_eq!(url, Some(endpoint.base_url.clone()));
    assert!(coordinator.registry().list_all().await.is_empty(), "hosted providers create no C2 entry");
    assert!((coordinator.memory().usage(&endpoint) - 0.0).abs() < 1e-9, "hosted providers take no reservation");
}

#[tokio::test]
async fn start_subagent_backend_is_idempotent_for_a_hosted_provider() {
    let coordinator = coordinator();
    let endpoint = hosted_endpoint().await;

    let first = coordinator.start_subagent_backend("run-hosted", "coder", endpoint.clone()).await.unwrap();
    let second = coordinator.start_subagent_backend("run-hosted", "coder", endpoint.clone()).await.unwrap();

    assert_eq!(first, second);
    assert!(coordinator.registry().list_all().await.is_empty());
}

#[tokio::test]
async fn stop_subagent_backend_refuses_a_main_owned_entry() {
    let coordinator = coordinator();
    let endpoint = hosted_endpoint().await;
    let run_id = "run-persistent";
    let key = subagent_key(run_id);

    coordinator
        .registry()
        .put(
            key.clone(),
            ProcessEntry {
                status: Status::Running,
                ..ProcessEntry::new(Owner::Main, endpoint, Transport::HostedNoop)
            },
        )
        .await;

    assert!(!coordinator.can_stop(run_id).await);
    assert!(!coordinator.stop_subagent_backend(run_id).await.unwrap());
    assert!(coordinator.registry().get(&key).await.is_some(), "a refused stop must not mutate state");
}

#[tokio::test]
async fn stop_subagent_backend_on_an_absent_run_id_succeeds_with_no_mutation() {
    let coordinator = coordinator();
    assert!(coordinator.stop_subagent_backend("never-started").await.unwrap());
    assert!(coordinator.status("never-started").await.is_none());
    assert!(coordinator.base_url_of("never-started").await.is_none());
    assert!(!coordinator.is_running("never-started").await);
    assert!(coordinator.can_stop("never-started").await, "an absent entry is trivially stoppable");
}

#[tokio::test]
async fn cancel_pending_rejects_a_parked_waiter_through_the_coordinator() {
    let coordinator = coordinator();
    assert!(!coordinator.cancel_pending("run-not-parked").await);
}

#[tokio::test]
async fn teardown_session_is_a_no_op_when_no_waiters_are_parked() {
    let coordinator = coordinator();
    // Nothing parked under this session id; must not panic or error.
    coordinator.teardown_session("session-empty").await;
}
