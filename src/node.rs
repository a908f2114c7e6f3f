//! Propagation vertices and their topological ranks.
//!
//! Every stream owns a node; every listener gets one. Edges between nodes
//! describe where firings flow, and the rank of a node decides when the
//! transaction queue visits it: for an edge `u → v` built with
//! [`EdgeKind::Immediate`], `rank(u) < rank(v)` holds at all times. Edges
//! installed by forward-reference loops are [`EdgeKind::Delayed`]; they mark
//! the boundary of an intentional cycle and are exempt from that invariant,
//! so rank analysis never has to walk around the cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Recursion bound for rank regeneration. A well-formed graph settles in
/// one pass over the descendants of the linked node; running into this
/// bound means an immediate-edge cycle.
const REGENERATION_DEPTH_BOUND: u32 = 1 << 16;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of an edge, unique for the lifetime of the process. Edges
/// compare equal exactly when their ids do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

impl TargetId {
    fn fresh() -> TargetId {
        TargetId(NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// How an edge participates in rank maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Ordinary dataflow edge; the rank invariant holds across it.
    Immediate,
    /// Back edge installed by a loop. Regeneration does not traverse it.
    Delayed,
}

struct Edge {
    id: TargetId,
    kind: EdgeKind,
    downstream: Weak<NodeData>,
}

struct NodeData {
    id: u64,
    rank: Mutex<u64>,
    targets: Mutex<SmallVec<[Edge; 2]>>,
}

/// A propagation vertex with stable identity and a topological rank.
///
/// Cloning shares the vertex. The node keeps only weak references to its
/// downstream vertices; ownership of a node rests with the stream or
/// listener it belongs to.
pub struct Node {
    data: Arc<NodeData>,
}

impl Clone for Node {
    fn clone(&self) -> Node {
        Node {
            data: self.data.clone(),
        }
    }
}

impl Node {
    /// Create a fresh node with rank zero and no outgoing edges.
    pub fn new() -> Node {
        Node {
            data: Arc::new(NodeData {
                id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
                rank: Mutex::new(0),
                targets: Mutex::new(SmallVec::new()),
            }),
        }
    }

    /// The current rank. Ranks only ever grow.
    pub fn rank(&self) -> u64 {
        *self.data.rank.lock().unwrap()
    }

    /// Insert an edge from this node to `downstream`.
    ///
    /// When the downstream rank does not exceed this node's rank, a
    /// regeneration pass bumps the downstream node and its descendants
    /// until the order is restored. The returned flag is `true` in that
    /// case; the caller must then ask the current transaction to resort
    /// its queue before the next dispatch.
    pub fn link(&self, downstream: &Node, kind: EdgeKind) -> Result<(bool, TargetId)> {
        let id = TargetId::fresh();
        let source_rank = self.rank();
        let bumped = if downstream.rank() <= source_rank {
            let floor = source_rank.checked_add(1).ok_or(Error::RankOverflow)?;
            debug!(
                "rank regeneration: node {} -> node {}",
                self.data.id, downstream.data.id
            );
            regenerate(&downstream.data, floor, 0)?;
            // If the cascade circled back and raised this node again, the
            // new edge would close an immediate cycle.
            if kind == EdgeKind::Immediate && downstream.rank() <= self.rank() {
                return Err(Error::CycleDetected);
            }
            true
        } else {
            false
        };
        self.data.targets.lock().unwrap().push(Edge {
            id,
            kind,
            downstream: Arc::downgrade(&downstream.data),
        });
        Ok((bumped, id))
    }

    /// Remove the edge with the given id. Ranks stay where regeneration
    /// left them; they are only used for ordering, so leaving them high is
    /// harmless.
    pub fn unlink(&self, id: TargetId) {
        self.data.targets.lock().unwrap().retain(|edge| edge.id != id);
    }

    /// Number of live outgoing edges.
    #[cfg(test)]
    pub fn target_count(&self) -> usize {
        self.data.targets.lock().unwrap().len()
    }

    #[cfg(test)]
    fn set_rank(&self, rank: u64) {
        *self.data.rank.lock().unwrap() = rank;
    }
}

/// Raise `node` to at least `floor` and propagate the increase through its
/// immediate descendants.
fn regenerate(node: &NodeData, floor: u64, depth: u32) -> Result<()> {
    if depth >= REGENERATION_DEPTH_BOUND {
        return Err(Error::CycleDetected);
    }
    {
        let mut rank = node.rank.lock().unwrap();
        if *rank >= floor {
            return Ok(());
        }
        *rank = floor;
    }
    let next = floor.checked_add(1).ok_or(Error::RankOverflow)?;
    let descendants: SmallVec<[Weak<NodeData>; 2]> = node
        .targets
        .lock()
        .unwrap()
        .iter()
        .filter(|edge| edge.kind == EdgeKind::Immediate)
        .map(|edge| edge.downstream.clone())
        .collect();
    for weak in descendants {
        if let Some(downstream) = weak.upgrade() {
            regenerate(&downstream, next, depth + 1)?;
        }
    }
    Ok(())
}
