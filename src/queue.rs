//! Per-session admission queue (`spec.md` §4.4, C4).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::model::Waiter;

/// Parks subagent starts that cannot currently run, keyed by requester
/// session id so that waiters from different sessions never starve each
/// other (`spec.md` §4.4: "Queues are keyed by requester session id").
#[derive(Clone, Default)]
pub struct AdmissionQueue {
    sessions: Arc<Mutex<HashMap<String, VecDeque<Waiter>>>>,
}

impl AdmissionQueue {
    #[must_use]
    pub fn new() -> Self {
        AdmissionQueue::default()
    }

    /// Parks `waiter` at the back of its session's FIFO.
    pub async fn park(&self, session_id: &str, waiter: Waiter) {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(session_id.to_string()).or_default().push_back(waiter);
    }

    /// Removes the waiter for `run_id` (any session) and rejects it with a
    /// cancellation error (`spec.md` §4.4, "Cancellation").
    pub async fn cancel(&self, run_id: &str, reason: impl Into<String> + Clone) -> bool {
        let mut sessions = self.sessions.lock().await;
        for queue in sessions.values_mut() {
            if let Some(pos) = queue.iter().position(|w| w.run_id == run_id) {
                let waiter = queue.remove(pos).expect("position just found");
                waiter.cancel(reason);
                return true;
            }
        }
        false
    }

    /// Rejects every waiter belonging to `session_id` with "session ended"
    /// (`spec.md` §4.4, "Session teardown").
    pub async fn teardown_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(queue) = sessions.remove(session_id) {
            for waiter in queue {
                waiter.cancel("session ended");
            }
        }
    }

    /// Scans every session once and wakes at most one eligible waiter
    /// whose `model_key` is not in `occupied_model_keys` — the oldest
    /// (FIFO) eligible waiter across all sessions is chosen, so a
    /// head-of-line blocker on an occupied key does not prevent a later
    /// waiter on a free key from running (`spec.md` §4.4). The wake is
    /// dispatched on a fresh task so the releaser's lock is not held
    /// across the waiter's continuation (`spec.md` §4.4, "Resume
    /// discipline").
    pub async fn wake_one(&self, occupied_model_keys: &[String]) -> Option<String> {
        let mut sessions = self.sessions.lock().await;

        let mut best: Option<(String, usize, std::time::Instant)> = None;
        for (session_id, queue) in sessions.iter() {
            if let Some((idx, waiter)) = queue
                .iter()
                .enumerate()
                .find(|(_, w)| !occupied_model_keys.contains(&w.model_key))
            {
                let better = match &best {
                    None => true,
                    Some((_, _, at)) => waiter.requested_at < *at,
                };
                if better {
                    best = Some((session_id.clone(), idx, waiter.requested_at));
                }
            }
        }

        let (session_id, idx, _) = best?;
        let queue = sessions.get_mut(&session_id)?;
        let waiter = queue.remove(idx)?;
        if queue.is_empty() {
            sessions.remove(&session_id);
        }

        let run_id = waiter.run_id.clone();
        tokio::spawn(async move {
            waiter.admit();
        });
        Some(run_id)
    }

    /// Total number of parked waiters across all sessions, for tests and
    /// diagnostics.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.values().map(VecDeque::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
