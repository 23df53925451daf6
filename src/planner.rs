//! Dependency planning and parallel/sequential arbitration (`spec.md`
//! §4.5, C5).
//!
//! Pure and synchronous: no I/O, no locking, just `HashMap`/`Vec` over the
//! caller-supplied batch.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::TaskDescriptor;

/// Whether a batch should run its tasks concurrently or one after another
/// (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Parallel,
    Sequential,
}

/// Result of planning one batch (`spec.md` §4.5, "Output").
#[derive(Debug, Clone)]
pub struct Plan {
    pub strategy: Strategy,
    /// A topological order over the batch for an acyclic input; for a
    /// cyclic input, the residual (unscheduled) subagent ids.
    pub order: Vec<String>,
    pub can_run: bool,
    pub reason: String,
}

/// The largest batch size the memory-feasibility subset-sum search
/// enumerates exhaustively before falling back to a greedy knapsack
/// approximation (`SPEC_FULL.md` §4.5: "bounded ... above a size
/// threshold"). 20 keeps the exhaustive `2^n` search well under a
/// millisecond for any realistic subagent batch.
const EXHAUSTIVE_SUBSET_LIMIT: usize = 20;

/// Builds a DAG from `dependsOn`, extracts a topological order via
/// Kahn's algorithm, and reports a cycle if a pass makes no progress
/// with tasks still remaining (`spec.md` §4.5, "Algorithm").
#[must_use]
pub fn plan(tasks: &[TaskDescriptor], effective_cap: f64) -> Plan {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.subagent_id.as_str()).collect();

    // dependents[x] = tasks that depend on x; indegree[x] = tasks x depends on
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        indegree.entry(task.subagent_id.as_str()).or_insert(0);
        if let Some(dep) = task.depends_on.as_deref() {
            if ids.contains(dep) {
                *indegree.entry(task.subagent_id.as_str()).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(task.subagent_id.as_str());
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    // Deterministic order: process ready tasks in batch order.
    let batch_order: Vec<&str> = tasks.iter().map(|t| t.subagent_id.as_str()).collect();
    queue.make_contiguous().sort_by_key(|id| batch_order.iter().position(|b| b == id));

    let mut order: Vec<String> = Vec::with_capacity(tasks.len());
    let mut remaining = indegree.clone();

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(deps) = dependents.get(id) {
            let mut newly_ready = Vec::new();
            for &dependent in deps {
                if let Some(deg) = remaining.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        newly_ready.push(dependent);
                    }
                }
            }
            newly_ready.sort_by_key(|id| batch_order.iter().position(|b| b == id));
            for id in newly_ready {
                queue.push_back(id);
            }
        }
    }

    let has_edges = tasks.iter().any(|t| t.depends_on.is_some());

    if order.len() != tasks.len() {
        let scheduled: HashSet<&str> = order.iter().map(String::as_str).collect();
        let residual: Vec<String> = tasks
            .iter()
            .map(|t| t.subagent_id.clone())
            .filter(|id| !scheduled.contains(id.as_str()))
            .collect();
        return Plan {
            strategy: Strategy::Sequential,
            order: residual,
            can_run: false,
            reason: "batch contains a dependency cycle".to_string(),
        };
    }

    if !has_edges && is_parallel_feasible(tasks, effective_cap) {
        return Plan {
            strategy: Strategy::Parallel,
            order,
            can_run: true,
            reason: "no dependencies and batch fits within the memory cap".to_string(),
        };
    }

    let reason = if has_edges {
        "batch has dependency edges".to_string()
    } else {
        "batch exceeds the memory-feasible parallel subset".to_string()
    };

    Plan {
        strategy: Strategy::Sequential,
        order,
        can_run: true,
        reason,
    }
}

/// `true` if every memory-tracked task in the batch can run at once
/// within `effective_cap` (`spec.md` §4.5, "Memory feasibility"). Untracked
/// providers (hosted) never contend for memory and are ignored here.
fn is_parallel_feasible(tasks: &[TaskDescriptor], effective_cap: f64) -> bool {
    let tracked: Vec<f64> = tasks
        .iter()
        .filter(|t| t.provider.is_memory_tracked())
        .map(|t| t.reserved_fraction)
        .collect();

    if tracked.is_empty() {
        return true;
    }

    let total: f64 = tracked.iter().sum();
    total <= effective_cap + f64::EPSILON
}

/// Largest `k` such that some `k`-subset of the batch's memory-tracked
/// tasks fits within `effective_cap` (`spec.md` §4.5). Exhaustive for
/// small batches, falling back to a greedy (largest-fraction-first)
/// approximation above [`EXHAUSTIVE_SUBSET_LIMIT`] — documented in
/// `DESIGN.md` as the implementation's choice for the open question
/// around chunked-parallel scheduling.
#[must_use]
pub fn largest_feasible_subset(tasks: &[TaskDescriptor], effective_cap: f64) -> usize {
    let tracked: Vec<f64> = tasks
        .iter()
        .filter(|t| t.provider.is_memory_tracked())
        .map(|t| t.reserved_fraction)
        .collect();

    if tracked.is_empty() {
        return tasks.len();
    }

    if tracked.len() <= EXHAUSTIVE_SUBSET_LIMIT {
        let mut best = 0usize;
        for mask in 0u32..(1u32 << tracked.len()) {
            let mut sum = 0.0;
            let mut count = 0usize;
            for (i, fraction) in tracked.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    sum += fraction;
                    count += 1;
                }
            }
            if sum <= effective_cap + f64::EPSILON && count > best {
                best = count;
            }
        }
        return best + (tasks.len() - tracked.len());
    }

    let mut sorted = tracked.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mut sum = 0.0;
    let mut count = 0usize;
    for fraction in sorted {
        if sum + fraction > effective_cap + f64::EPSILON {
            break;
        }
        sum += fraction;
        count += 1;
    }
    count + (tasks.len() - tracked.len())
}
