//! Knowledge-graph maintenance scheduler contract (`spec.md` §4.8, C8).
//!
//! `spec.md` treats the graph store as an external collaborator described
//! only by contract; no concrete implementation ships here. The scheduler's
//! overlap guard is grounded on the host project's garbage collector, which
//! gates a cleanup pass on a "last cleaned up at" timestamp so overlapping
//! runs are skipped rather than queued — generalized here to two
//! independent timers instead of one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;

/// The external knowledge-graph collaborator C8 drives. No implementation
/// ships in this crate; an embedder supplies one backed by whatever graph
/// store it already runs.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Decays confidence scores across the graph. Returns the number of
    /// nodes touched.
    async fn decay_confidence(&self) -> Result<u64>;

    /// Removes nodes whose confidence has decayed below the store's
    /// threshold. Returns the number of nodes removed.
    async fn cleanup_low_confidence(&self) -> Result<u64>;

    /// Removes nodes past the store's retention age. Returns the number of
    /// nodes removed.
    async fn cleanup_old_nodes(&self) -> Result<u64>;

    async fn count_entities(&self) -> Result<u64>;
    async fn count_relations(&self) -> Result<u64>;
}

/// Governs how often decay and cleanup passes run (`spec.md` §4.8: "decay
/// runs at most 10 times per half-life, never more than once per day").
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSchedule {
    pub decay_interval: Duration,
    pub cleanup_interval: Duration,
}

impl MaintenanceSchedule {
    /// Derives a decay interval from `half_life`, clamped so it fires at
    /// most 10 times per half-life and never more than once a day, plus a
    /// cleanup interval (default: once a day).
    #[must_use]
    pub fn from_half_life(half_life: Duration) -> Self {
        let per_half_life = half_life / 10;
        let decay_interval = per_half_life.max(Duration::from_secs(86_400));
        MaintenanceSchedule {
            decay_interval,
            cleanup_interval: Duration::from_secs(86_400),
        }
    }
}

impl Default for MaintenanceSchedule {
    fn default() -> Self {
        MaintenanceSchedule::from_half_life(Duration::from_secs(7 * 86_400))
    }
}

/// Drives a [`GraphStore`]'s decay and cleanup passes on independent
/// timers, each guarded so an overlapping tick is skipped rather than
/// queued behind a slow pass (`spec.md` §4.8).
pub struct MaintenanceScheduler {
    store: Arc<dyn GraphStore>,
    schedule: MaintenanceSchedule,
    decay_in_flight: Mutex<()>,
    cleanup_in_flight: Mutex<()>,
}

impl MaintenanceScheduler {
    #[must_use]
    pub fn new(store: Arc<dyn GraphStore>, schedule: MaintenanceSchedule) -> Self {
        MaintenanceScheduler {
            store,
            schedule,
            decay_in_flight: Mutex::new(()),
            cleanup_in_flight: Mutex::new(()),
        }
    }

    /// Runs the two interval loops until the returned handle is dropped or
    /// aborted. Each loop ticks independently; a tick that finds the
    /// previous pass still running is skipped with a debug log rather than
    /// queued.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut decay_timer = tokio::time::interval(self.schedule.decay_interval);
            let mut cleanup_timer = tokio::time::interval(self.schedule.cleanup_interval);
            loop {
                tokio::select! {
                    _ = decay_timer.tick() => self.run_decay_tick().await,
                    _ = cleanup_timer.tick() => self.run_cleanup_tick().await,
                }
            }
        })
    }

    async fn run_decay_tick(&self) {
        let Ok(_guard) = self.decay_in_flight.try_lock() else {
            debug!("decay tick skipped: previous pass still in flight");
            return;
        };
        match self.store.decay_confidence().await {
            Ok(touched) => info!(touched, "confidence decay pass complete"),
            Err(error) => warn!(%error, "confidence decay pass failed"),
        }
    }

    async fn run_cleanup_tick(&self) {
        let Ok(_guard) = self.cleanup_in_flight.try_lock() else {
            debug!("cleanup tick skipped: previous pass still in flight");
            return;
        };
        match self.run_cleanup_once().await {
            Ok((low_confidence, old)) => {
                info!(low_confidence, old, "cleanup pass complete");
            }
            Err(error) => warn!(%error, "cleanup pass failed"),
        }
    }

    async fn run_cleanup_once(&self) -> Result<(u64, u64)> {
        let low_confidence = self.store.cleanup_low_confidence().await?;
        let old = self.store.cleanup_old_nodes().await?;
        Ok((low_confidence, old))
    }
}
