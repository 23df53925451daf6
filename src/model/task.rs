use tokio::sync::oneshot;

use crate::error::Result;

use super::endpoint::Provider;

/// One unit of planner input: a subagent to run, the provider its model
/// binding requires, the memory fraction it will reserve, and an optional
/// dependency that must complete first (`spec.md` §3, §5).
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub subagent_id: String,
    pub provider: Provider,
    pub reserved_fraction: f64,
    pub depends_on: Option<String>,
}

impl TaskDescriptor {
    #[must_use]
    pub fn new(subagent_id: impl Into<String>, provider: Provider, reserved_fraction: f64) -> Self {
        TaskDescriptor {
            subagent_id: subagent_id.into(),
            provider,
            reserved_fraction,
            depends_on: None,
        }
    }

    #[must_use]
    pub fn depending_on(mut self, subagent_id: impl Into<String>) -> Self {
        self.depends_on = Some(subagent_id.into());
        self
    }
}

/// A parked start request held by the admission queue until its model key
/// is free and memory admits it (`spec.md` §3, §4.4).
///
/// The `resolver` is consumed exactly once: either by the queue waking the
/// waiter with `Ok(())` on admission, or by cancellation delivering an
/// error. Dropping a `Waiter` without resolving it signals cancellation to
/// the awaiting receiver via the standard `oneshot` closed-channel error.
pub struct Waiter {
    pub run_id: String,
    pub subagent_id: String,
    pub model_key: String,
    pub reserved_fraction: f64,
    pub requested_at: std::time::Instant,
    resolver: oneshot::Sender<Result<()>>,
}

impl Waiter {
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        subagent_id: impl Into<String>,
        model_key: impl Into<String>,
        reserved_fraction: f64,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Waiter {
                run_id: run_id.into(),
                subagent_id: subagent_id.into(),
                model_key: model_key.into(),
                reserved_fraction,
                requested_at: std::time::Instant::now(),
                resolver: tx,
            },
            rx,
        )
    }

    /// Consumes the waiter, admitting it. The receiving side's `await`
    /// resolves to `Ok(())`. Returns `Err` only if the receiver was already
    /// dropped (the caller gave up).
    pub fn admit(self) {
        let _ = self.resolver.send(Ok(()));
    }

    /// Consumes the waiter, delivering a cancellation error instead of
    /// admission.
    pub fn cancel(self, reason: impl Into<String>) {
        let _ = self.resolver.send(Err(crate::error::CrateError::WaiterCancelled {
            run_id: self.run_id.clone(),
            reason: reason.into(),
        }));
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("run_id", &self.run_id)
            .field("subagent_id", &self.subagent_id)
            .field("model_key", &self.model_key)
            .field("reserved_fraction", &self.reserved_fraction)
            .finish_non_exhaustive()
    }
}
