//! Signal graph: DAG-based routing with a cached topological order.
//!
//! Vertices are tracks and buses. Edges carry audio from a node into a bus
//! (main output or send) or from a bus into an aux track's input. Every edge
//! takes part in the cycle check, so the graph is acyclic at all times.

use crate::error::CycleError;
use crate::types::{BusId, NodeId, TrackId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// The node's post-fader output. At most one per node.
    Output,
    /// A post-fader copy at an independent level.
    Send,
    /// A bus feeding an aux track's input.
    AuxInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalGraph {
    /// Vertices in insertion order. Ties in the processing order follow this.
    nodes: Vec<NodeId>,
    edges: Vec<Edge>,
    /// Cached processing order. `None` after any structural change.
    #[serde(skip)]
    order: Option<Vec<NodeId>>,
}

impl SignalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn add_node(&mut self, node: NodeId) {
        if !self.contains(node) {
            self.nodes.push(node);
            self.order = None;
        }
    }

    /// Remove a vertex and every edge touching it.
    pub fn remove_node(&mut self, node: NodeId) -> bool {
        let Some(idx) = self.nodes.iter().position(|n| *n == node) else {
            return false;
        };
        self.nodes.remove(idx);
        self.edges.retain(|e| e.from != node && e.to != node);
        self.order = None;
        true
    }

    /// Route `from`'s main output into `to`, replacing any previous output.
    ///
    /// Fails without touching the graph if the edge would close a loop.
    pub fn connect(&mut self, from: NodeId, to: BusId) -> Result<(), CycleError> {
        let to = NodeId::Bus(to);
        self.check_edge(from, to)?;
        self.edges
            .retain(|e| !(e.from == from && e.kind == EdgeKind::Output));
        self.push_edge(from, to, EdgeKind::Output);
        Ok(())
    }

    /// Remove the main output edge `from -> to`. No-op if it does not exist.
    pub fn disconnect(&mut self, from: NodeId, to: BusId) -> bool {
        self.remove_edge(from, NodeId::Bus(to), EdgeKind::Output)
    }

    pub fn add_send(&mut self, from: NodeId, to: BusId) -> Result<(), CycleError> {
        let to = NodeId::Bus(to);
        if self.has_edge(from, to, EdgeKind::Send) {
            return Ok(());
        }
        self.check_edge(from, to)?;
        self.push_edge(from, to, EdgeKind::Send);
        Ok(())
    }

    pub fn remove_send(&mut self, from: NodeId, to: BusId) -> bool {
        self.remove_edge(from, NodeId::Bus(to), EdgeKind::Send)
    }

    /// Feed `track` from `bus`, or clear its input with `None`.
    pub fn set_aux_input(&mut self, track: TrackId, bus: Option<BusId>) -> Result<(), CycleError> {
        let to = NodeId::Track(track);
        if let Some(bus) = bus {
            let from = NodeId::Bus(bus);
            if self.has_edge(from, to, EdgeKind::AuxInput) {
                return Ok(());
            }
            self.check_edge(from, to)?;
        }
        self.edges
            .retain(|e| !(e.to == to && e.kind == EdgeKind::AuxInput));
        if let Some(bus) = bus {
            self.push_edge(NodeId::Bus(bus), to, EdgeKind::AuxInput);
        } else {
            self.order = None;
        }
        Ok(())
    }

    pub fn output_of(&self, node: NodeId) -> Option<BusId> {
        self.edges
            .iter()
            .find(|e| e.from == node && e.kind == EdgeKind::Output)
            .and_then(|e| e.to.as_bus())
    }

    pub fn sends_of(&self, node: NodeId) -> impl Iterator<Item = BusId> + '_ {
        self.edges
            .iter()
            .filter(move |e| e.from == node && e.kind == EdgeKind::Send)
            .filter_map(|e| e.to.as_bus())
    }

    pub fn aux_input_of(&self, track: TrackId) -> Option<BusId> {
        let to = NodeId::Track(track);
        self.edges
            .iter()
            .find(|e| e.to == to && e.kind == EdgeKind::AuxInput)
            .and_then(|e| e.from.as_bus())
    }

    /// Nodes whose output or sends land on `bus`.
    pub fn contributors(&self, bus: BusId) -> impl Iterator<Item = NodeId> + '_ {
        let to = NodeId::Bus(bus);
        self.edges
            .iter()
            .filter(move |e| e.to == to && e.kind != EdgeKind::AuxInput)
            .map(|e| e.from)
    }

    /// True if adding `from -> to` would close a loop (including a self edge).
    pub fn would_create_cycle(&self, from: NodeId, to: NodeId) -> bool {
        // Is `from` reachable from `to`?
        let mut visited = HashSet::new();
        let mut stack = vec![to];
        while let Some(current) = stack.pop() {
            if current == from {
                return true;
            }
            if visited.insert(current) {
                stack.extend(self.edges.iter().filter(|e| e.from == current).map(|e| e.to));
            }
        }
        false
    }

    /// Processing order: every node comes after all nodes feeding it.
    /// Ties are broken by insertion order. Recomputed only after a structural change.
    pub fn topological_order(&mut self) -> &[NodeId] {
        if self.order.is_none() {
            self.order = Some(self.compute_order());
        }
        self.order.as_deref().unwrap_or_default()
    }

    /// Kahn's algorithm with a min-heap on insertion index.
    fn compute_order(&self) -> Vec<NodeId> {
        let index: HashMap<NodeId, usize> =
            self.nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for e in &self.edges {
            if let (Some(&a), Some(&b)) = (index.get(&e.from), index.get(&e.to)) {
                adjacency[a].push(b);
                in_degree[b] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(self.nodes[i]);
            for &j in &adjacency[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }
        if order.len() != self.nodes.len() {
            log::error!(
                "signal graph has a cycle: ordered {} of {} nodes",
                order.len(),
                self.nodes.len()
            );
        }
        order
    }

    /// Check the whole graph, e.g. after loading it from a document.
    pub fn validate(&self) -> Result<(), CycleError> {
        if let Some(e) = self.edges.iter().find(|e| e.from == e.to) {
            return Err(CycleError {
                from: e.from,
                to: e.to,
            });
        }
        if self.compute_order().len() != self.nodes.len() {
            let e = self.edges.last().copied();
            return Err(e.map_or(
                CycleError {
                    from: NodeId::Bus(BusId::MASTER),
                    to: NodeId::Bus(BusId::MASTER),
                },
                |e| CycleError {
                    from: e.from,
                    to: e.to,
                },
            ));
        }
        Ok(())
    }

    fn check_edge(&self, from: NodeId, to: NodeId) -> Result<(), CycleError> {
        if self.would_create_cycle(from, to) {
            return Err(CycleError { from, to });
        }
        Ok(())
    }

    fn has_edge(&self, from: NodeId, to: NodeId, kind: EdgeKind) -> bool {
        self.edges
            .iter()
            .any(|e| e.from == from && e.to == to && e.kind == kind)
    }

    fn push_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) {
        self.edges.push(Edge { from, to, kind });
        self.order = None;
    }

    fn remove_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) -> bool {
        let before = self.edges.len();
        self.edges
            .retain(|e| !(e.from == from && e.to == to && e.kind == kind));
        let removed = self.edges.len() != before;
        if removed {
            self.order = None;
        }
        removed
    }
}
