//! Deadlock detection over the wait-for graph
//!
//! The detector snapshots the lock registry's wait-for edges (A → B when A
//! waits on an entity B holds), runs a depth-first search with three-color
//! marking, and reports every distinct cycle as a [`DeadlockInfo`].
//!
//! ## Victim selection
//!
//! The youngest transaction in the cycle (latest start time) is chosen.
//! Older transactions have usually done more work and are closer to
//! finishing. Transactions unknown to the registry count as youngest.
//!
//! The detector only reports. Rolling the victim back is the
//! coordinator's job.

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::{EntityKey, LockMode, TxnId};
use tracing::warn;

use crate::lock::{LockRegistry, WaitEdge};

/// Contended resource inside a deadlock cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockResource {
    /// Entity being waited on
    pub key: EntityKey,
    /// Mode the waiter asked for
    pub mode: LockMode,
}

/// How a deadlock is broken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockResolution {
    /// Roll back the youngest transaction in the cycle
    AbortYoungest,
}

impl DeadlockResolution {
    /// Stable tag used in logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlockResolution::AbortYoungest => "abort_youngest",
        }
    }
}

/// One detected deadlock
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlockInfo {
    /// Transactions forming the cycle, in wait order
    pub transaction_ids: Vec<TxnId>,
    /// Entities contended along the cycle
    pub resources: Vec<DeadlockResource>,
    /// Detection time
    pub detected_at: DateTime<Utc>,
    /// Resolution applied
    pub resolution: DeadlockResolution,
    /// Transaction chosen to be rolled back
    pub victim: TxnId,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Find every elementary cycle reachable by DFS in the wait-for graph
///
/// Each cycle is returned once, in wait order, starting from the node
/// where the DFS first closed it.
pub fn find_cycles(edges: &[WaitEdge]) -> Vec<Vec<TxnId>> {
    let mut adjacency: FxHashMap<TxnId, Vec<TxnId>> = FxHashMap::default();
    let mut nodes: Vec<TxnId> = Vec::new();
    for edge in edges {
        for node in [edge.waiter, edge.holder] {
            if !adjacency.contains_key(&node) {
                adjacency.insert(node, Vec::new());
                nodes.push(node);
            }
        }
        if let Some(next) = adjacency.get_mut(&edge.waiter) {
            if !next.contains(&edge.holder) {
                next.push(edge.holder);
            }
        }
    }

    let mut colors: FxHashMap<TxnId, Color> =
        nodes.iter().map(|n| (*n, Color::White)).collect();
    let mut path = Vec::new();
    let mut seen: FxHashSet<Vec<TxnId>> = FxHashSet::default();
    let mut cycles = Vec::new();

    for node in &nodes {
        if colors.get(node) == Some(&Color::White) {
            visit(
                *node,
                &adjacency,
                &mut colors,
                &mut path,
                &mut seen,
                &mut cycles,
            );
        }
    }
    cycles
}

fn visit(
    node: TxnId,
    adjacency: &FxHashMap<TxnId, Vec<TxnId>>,
    colors: &mut FxHashMap<TxnId, Color>,
    path: &mut Vec<TxnId>,
    seen: &mut FxHashSet<Vec<TxnId>>,
    cycles: &mut Vec<Vec<TxnId>>,
) {
    colors.insert(node, Color::Gray);
    path.push(node);

    if let Some(next) = adjacency.get(&node) {
        for &succ in next {
            match colors.get(&succ).copied().unwrap_or(Color::White) {
                Color::White => visit(succ, adjacency, colors, path, seen, cycles),
                Color::Gray => {
                    // Back edge: the path from `succ` to here is a cycle
                    if let Some(start) = path.iter().position(|n| *n == succ) {
                        let cycle = path[start..].to_vec();
                        let mut canonical = cycle.clone();
                        canonical.sort();
                        if seen.insert(canonical) {
                            cycles.push(cycle);
                        }
                    }
                }
                Color::Black => {}
            }
        }
    }

    path.pop();
    colors.insert(node, Color::Black);
}

/// Periodic deadlock detector over a shared lock registry
pub struct DeadlockDetector {
    registry: Arc<LockRegistry>,
    detected: AtomicU64,
}

impl DeadlockDetector {
    /// Create a detector reading from `registry`
    pub fn new(registry: Arc<LockRegistry>) -> Self {
        Self {
            registry,
            detected: AtomicU64::new(0),
        }
    }

    /// Build the wait-for graph and report every cycle
    pub fn detect(&self) -> Vec<DeadlockInfo> {
        let edges = self.registry.wait_for_edges();
        if edges.is_empty() {
            return Vec::new();
        }

        let cycles = find_cycles(&edges);
        let infos: Vec<DeadlockInfo> = cycles
            .into_iter()
            .map(|cycle| {
                let resources = cycle_resources(&cycle, &edges);
                let victim = self.youngest(&cycle);
                DeadlockInfo {
                    transaction_ids: cycle,
                    resources,
                    detected_at: Utc::now(),
                    resolution: DeadlockResolution::AbortYoungest,
                    victim,
                }
            })
            .collect();

        for info in &infos {
            self.detected.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "strata::deadlock",
                victim = %info.victim,
                cycle_len = info.transaction_ids.len(),
                "Deadlock detected"
            );
        }
        infos
    }

    /// Total cycles reported since creation
    pub fn deadlocks_detected(&self) -> u64 {
        self.detected.load(Ordering::Relaxed)
    }

    fn youngest(&self, cycle: &[TxnId]) -> TxnId {
        let mut victim = cycle[0];
        let mut victim_start = None;
        for txn in cycle {
            match self.registry.transaction(*txn) {
                // Unregistered: cannot be older than anything, pick it
                None => return *txn,
                Some(active) => {
                    if victim_start.map_or(true, |s| active.started_at > s) {
                        victim = *txn;
                        victim_start = Some(active.started_at);
                    }
                }
            }
        }
        victim
    }
}

impl std::fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("detected", &self.deadlocks_detected())
            .finish()
    }
}

fn cycle_resources(cycle: &[TxnId], edges: &[WaitEdge]) -> Vec<DeadlockResource> {
    let mut resources = Vec::new();
    for (i, waiter) in cycle.iter().enumerate() {
        let holder = cycle[(i + 1) % cycle.len()];
        if let Some(edge) = edges
            .iter()
            .find(|e| e.waiter == *waiter && e.holder == holder)
        {
            resources.push(DeadlockResource {
                key: edge.key.clone(),
                mode: edge.mode,
            });
        }
    }
    resources
}
