//! Memory architecture detection and reservation accounting (`spec.md`
//! §4.3, C3).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{ArchitectureKind, Config};
use crate::model::{Endpoint, Provider, ReservationKey};

/// Probes host-specific signals needed to pick a memory architecture.
/// Injected so architecture detection is testable without real hardware,
/// matching the host project's pattern of swapping in test doubles behind
/// a trait rather than calling platform APIs directly from business logic.
pub trait ArchitectureProbe: Send + Sync {
    /// `true` if the CPU model string looks like Apple Silicon (`spec.md`
    /// §4.3: "Apple-Silicon-class CPU model string").
    fn is_apple_silicon(&self) -> bool;

    /// `true` if a local GPU management tool responds within a bounded
    /// probe on Linux/Windows (`spec.md` §4.3).
    fn has_local_gpu_tool(&self) -> bool;

    /// `true` if an environment hint requests `remote-gpu` (`spec.md`
    /// §4.3, "environment hint").
    fn remote_gpu_env_hint(&self) -> bool;
}

/// Reads real platform signals: `/proc/cpuinfo` on Linux for the CPU
/// model string, `nvidia-smi`/`rocm-smi` presence for a local GPU tool, and
/// the `MODELPOOL_FORCE_REMOTE_GPU` environment variable for the remote
/// hint.
pub struct HostArchitectureProbe;

impl ArchitectureProbe for HostArchitectureProbe {
    fn is_apple_silicon(&self) -> bool {
        cfg!(target_os = "macos") && cfg!(target_arch = "aarch64")
    }

    fn has_local_gpu_tool(&self) -> bool {
        which("nvidia-smi") || which("rocm-smi")
    }

    fn remote_gpu_env_hint(&self) -> bool {
        std::env::var("MODELPOOL_FORCE_REMOTE_GPU")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

fn which(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

/// Detects the architecture per `spec.md` §4.3: `unified-memory` if the
/// probe reports Apple Silicon and the remote-GPU opt-in is unset,
/// `local-gpu` if a local GPU tool is present, `remote-gpu` if the env
/// hint is set or any catalog entry requires a remote/docker-remote
/// server, else `local-gpu`.
#[must_use]
pub fn detect_architecture(
    probe: &dyn ArchitectureProbe,
    config: &Config,
    catalog_requires_remote: bool,
) -> ArchitectureKind {
    if let Some(overridden) = config.architecture_override {
        return overridden;
    }

    if probe.is_apple_silicon() && !probe.remote_gpu_env_hint() && !config.force_remote_gpu {
        return ArchitectureKind::UnifiedMemory;
    }

    if probe.remote_gpu_env_hint() || config.force_remote_gpu || catalog_requires_remote {
        return ArchitectureKind::RemoteGpu;
    }

    if probe.has_local_gpu_tool() {
        return ArchitectureKind::LocalGpu;
    }

    ArchitectureKind::LocalGpu
}

/// Tracks reserved memory fractions per `(provider, host:port)` and
/// answers admission queries against the effective cap for the detected
/// architecture (`spec.md` §4.3, §8: "Reservation sum ... never exceeds
/// the effective cap at any point during arbitrary interleavings").
pub struct MemoryAccountant {
    architecture: ArchitectureKind,
    effective_cap: f64,
    reservations: Mutex<HashMap<ReservationKey, f64>>,
}

impl MemoryAccountant {
    #[must_use]
    pub fn new(architecture: ArchitectureKind, config: &Config) -> Self {
        let (max, reserve) = config.caps_for(architecture);
        MemoryAccountant {
            architecture,
            effective_cap: (max - reserve).max(0.0),
            reservations: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn architecture(&self) -> ArchitectureKind {
        self.architecture
    }

    #[must_use]
    pub fn effective_cap(&self) -> f64 {
        self.effective_cap
    }

    /// `true` for non-memory-tracked providers (always admitted). For
    /// `vllm`/`sglang`, `true` iff current usage plus `fraction` does not
    /// exceed the effective cap. A fraction exactly equal to the remaining
    /// headroom is admitted (`spec.md` §8, boundary behavior).
    #[must_use]
    pub fn can_use(&self, endpoint: &Endpoint, fraction: f64) -> bool {
        if !endpoint.provider.is_memory_tracked() {
            return true;
        }

        let key = ReservationKey::new(endpoint.provider, endpoint.reservation_host_key());
        let reservations = self.reservations.lock().expect("reservation mutex poisoned");
        let current = reservations.get(&key).copied().unwrap_or(0.0);
        current + fraction <= self.effective_cap + f64::EPSILON
    }

    /// Adds `fraction` to the reservation at `endpoint`'s key. Non-tracked
    /// providers are a no-op, since their usage is never accounted
    /// (`spec.md` §4.3).
    pub fn add(&self, endpoint: &Endpoint, fraction: f64) {
        if !endpoint.provider.is_memory_tracked() {
            return;
        }

        let key = ReservationKey::new(endpoint.provider, endpoint.reservation_host_key());
        let mut reservations = self.reservations.lock().expect("reservation mutex poisoned");
        *reservations.entry(key).or_insert(0.0) += fraction;
    }

    /// Subtracts `fraction`, flooring at zero and deleting the entry once
    /// it reaches zero (`spec.md` §4.3).
    pub fn subtract(&self, endpoint: &Endpoint, fraction: f64) {
        if !endpoint.provider.is_memory_tracked() {
            return;
        }

        let key = ReservationKey::new(endpoint.provider, endpoint.reservation_host_key());
        let mut reservations = self.reservations.lock().expect("reservation mutex poisoned");
        if let Some(current) = reservations.get_mut(&key) {
            *current = (*current - fraction).max(0.0);
            if *current <= f64::EPSILON {
                reservations.remove(&key);
            }
        }
    }

    /// Current reservation for `endpoint`'s `(provider, host:port)` key,
    /// `0.0` if untracked or unreserved.
    #[must_use]
    pub fn usage(&self, endpoint: &Endpoint) -> f64 {
        if !endpoint.provider.is_memory_tracked() {
            return 0.0;
        }
        let key = ReservationKey::new(endpoint.provider, endpoint.reservation_host_key());
        self.reservations
            .lock()
            .expect("reservation mutex poisoned")
            .get(&key)
            .copied()
            .unwrap_or(0.0)
    }

    /// Usage directly by reservation key, for callers (the planner) that
    /// work with provider + fraction rather than a full endpoint.
    #[must_use]
    pub fn usage_for(&self, provider: Provider, host_port: &str) -> f64 {
        let key = ReservationKey::new(provider, host_port.to_string());
        self.reservations
            .lock()
            .expect("reservation mutex poisoned")
            .get(&key)
            .copied()
            .unwrap_or(0.0)
    }
}
