//! Concurrency-safe process registry (`spec.md` §4.2, C2).
//!
//! Backed by a `tokio::sync::Mutex<HashMap<..>>` plus a per-key lock map
//! that serializes concurrent starts for the same registry key. The host
//! project runs one agent session at a time and has no equivalent
//! component; this module is grounded on the keyed-map-of-live-process-
//! state shape used by the pack's swarm/registry examples, re-expressed
//! with Tokio's async mutex to match the host project's runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

use crate::error::RegistryKey;
use crate::model::{Owner, ProcessEntry};

/// Cooperative backoff between start-lock poll attempts (`spec.md` §4.2:
/// "the implementation may spin-wait with a 500 ms backoff"). Chosen to
/// privilege simplicity over fairness; the set of contenders per key is
/// expected to be small since callers de-duplicate by run id upstream.
const DEFAULT_LOCK_BACKOFF: Duration = Duration::from_millis(500);

/// A held start-lock for one registry key. Releases on drop so callers
/// cannot forget to unlock on an early return. Holding this guard across
/// the double-checked-admission + start sequence totally orders start/stop
/// of a given key (`spec.md` §5).
pub struct StartLockGuard {
    // Order matters: the owned guard must drop before the `Arc<Mutex<()>>`
    // it borrowed from, which is guaranteed by field-drop order.
    _guard: OwnedMutexGuard<()>,
}

struct RegistryInner {
    entries: Mutex<HashMap<RegistryKey, ProcessEntry>>,
    locks: Mutex<HashMap<RegistryKey, Arc<Mutex<()>>>>,
    lock_backoff: Duration,
}

/// Keyed map from registry key to [`ProcessEntry`], plus the per-key start
/// lock required by `spec.md` §4.2 and the start-path ordering in §4.7.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessRegistry {
    #[must_use]
    pub fn new() -> Self {
        ProcessRegistry::with_lock_backoff(DEFAULT_LOCK_BACKOFF)
    }

    #[must_use]
    pub fn with_lock_backoff(lock_backoff: Duration) -> Self {
        ProcessRegistry {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                lock_backoff,
            }),
        }
    }

    /// Acquires the serializing lock for `key`. Held across the caller's
    /// double-checked-admission + start sequence (`spec.md` §4.7, start path
    /// step 2). Cooperative: competing acquirers poll at
    /// `lock_backoff` intervals rather than queuing on a fair primitive.
    pub async fn acquire_start_lock(&self, key: &RegistryKey) -> StartLockGuard {
        loop {
            let lock = {
                let mut locks = self.inner.locks.lock().await;
                // Opportunistic prune: an entry with no outstanding clone is
                // not referenced by any in-flight acquirer, so it is safe to
                // drop rather than let the map grow once per run id forever.
                locks.retain(|_, l| Arc::strong_count(l) > 1);
                Arc::clone(locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
            };

            match Arc::clone(&lock).try_lock_owned() {
                Ok(guard) => return StartLockGuard { _guard: guard },
                Err(_) => tokio::time::sleep(self.inner.lock_backoff).await,
            }
        }
    }

    pub async fn get(&self, key: &RegistryKey) -> Option<ProcessEntry> {
        self.inner.entries.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: RegistryKey, entry: ProcessEntry) {
        self.inner.entries.lock().await.insert(key, entry);
    }

    /// Mutates the entry at `key` in place under the registry lock, if
    /// present. Used for status transitions that must not race a concurrent
    /// `get`/`put`.
    pub async fn update<F: FnOnce(&mut ProcessEntry)>(&self, key: &RegistryKey, f: F) {
        if let Some(entry) = self.inner.entries.lock().await.get_mut(key) {
            f(entry);
        }
    }

    pub async fn remove(&self, key: &RegistryKey) -> Option<ProcessEntry> {
        self.inner.entries.lock().await.remove(key)
    }

    /// A consistent snapshot of every entry owned by `owner` (`spec.md` §4.2).
    pub async fn list_by_owner(&self, owner: Owner) -> Vec<(RegistryKey, ProcessEntry)> {
        self.inner
            .entries
            .lock()
            .await
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    /// A consistent snapshot of every entry (`spec.md` §4.2, `listAll`).
    pub async fn list_all(&self) -> Vec<(RegistryKey, ProcessEntry)> {
        self.inner
            .entries
            .lock()
            .await
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    /// Locks the entry map directly; for callers that need multiple
    /// operations to appear atomic (e.g. the coordinator's double-checked
    /// admission inside a held start lock).
    pub async fn lock(&self) -> MutexGuard<'_, HashMap<RegistryKey, ProcessEntry>> {
        self.inner.entries.lock().await
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        ProcessRegistry::new()
    }
}

/// `main:<modelId>` registry key (`spec.md` GLOSSARY, "Registry key").
#[must_use]
pub fn main_key(model_id: &str) -> RegistryKey {
    format!("main:{model_id}")
}

/// `subagent:<runId>` registry key.
#[must_use]
pub fn subagent_key(run_id: &str) -> RegistryKey {
    format!("subagent:{run_id}")
}
