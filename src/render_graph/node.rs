//! Dependency graph shared by pass and resource nodes.
//!
//! Nodes live in an index arena and edges in a flat list. Culling walks
//! reference counts backwards from nodes nobody consumes.

use crate::backend::ImageUsage;
use std::fmt::Write as _;

/// Index of a node in the [`DependencyGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Pass,
    Resource,
}

#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    kind: NodeKind,
    ref_count: u32,
    side_effect: bool,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn has_side_effect(&self) -> bool {
        self.side_effect
    }

    /// Only meaningful after [`DependencyGraph::cull`].
    pub fn is_culled(&self) -> bool {
        self.ref_count == 0 && !self.side_effect
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Resource to the pass reading it.
    Read,
    /// Pass to the resource it writes.
    Write,
    /// Sub-resource to its parent.
    Parent,
    /// Moved resource to the resource now backing it.
    Alias,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
    pub usage: ImageUsage,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.into(),
            kind,
            ref_count: 0,
            side_effect: false,
        });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        assert!(id.0 < self.nodes.len(), "Node {} out of range", id.0);
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Exempt a node from culling.
    pub fn declare_side_effect(&mut self, id: NodeId) {
        self.nodes[id.0].side_effect = true;
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind, usage: ImageUsage) -> usize {
        self.edges.push(Edge { from, to, kind, usage });
        self.edges.len() - 1
    }

    /// Index of the first edge matching `from`, `to` and `kind`.
    pub fn find_edge(&self, from: NodeId, to: NodeId, kind: EdgeKind) -> Option<usize> {
        self.edges
            .iter()
            .position(|e| e.from == from && e.to == to && e.kind == kind)
    }

    pub fn edge_mut(&mut self, idx: usize) -> &mut Edge {
        &mut self.edges[idx]
    }

    /// Edges ending at `id`. For a pass these are the resources it reads.
    pub fn reader_edges(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.to == id)
    }

    /// Edges leaving `id`. For a pass these are the resources it writes.
    pub fn writer_edges(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Neither end of the edge was culled.
    pub fn is_valid_edge(&self, edge: &Edge) -> bool {
        !self.nodes[edge.from.0].is_culled() && !self.nodes[edge.to.0].is_culled()
    }

    /// Compute reference counts and cull every node that nothing with a side
    /// effect depends on.
    pub fn cull(&mut self) {
        for node in self.nodes.iter_mut() {
            node.ref_count = 0;
        }
        for edge in &self.edges {
            self.nodes[edge.from.0].ref_count += 1;
        }

        let mut stack: Vec<NodeId> = (0..self.nodes.len())
            .map(NodeId)
            .filter(|id| self.nodes[id.0].is_culled())
            .collect();

        while let Some(id) = stack.pop() {
            for edge_idx in 0..self.edges.len() {
                let edge = self.edges[edge_idx];
                if edge.to != id {
                    continue;
                }
                let producer = &mut self.nodes[edge.from.0];
                producer.ref_count -= 1;
                if producer.is_culled() {
                    stack.push(edge.from);
                }
            }
        }
    }

    /// DOT description of the graph. Edges touching a culled node are dashed.
    pub fn export_graphviz(&self) -> String {
        let mut out = String::new();
        out.push_str("digraph \"rendergraph\" {\n");
        out.push_str("bgcolor = white\n");
        out.push_str("node [shape=rectangle, fontname=\"arial\", fontsize=12]\n");

        for (idx, node) in self.nodes.iter().enumerate() {
            let colour = match (node.kind, node.is_culled()) {
                (_, true) => "lightgrey",
                (NodeKind::Pass, false) => "darkorange",
                (NodeKind::Resource, false) => "skyblue",
            };
            let _ = writeln!(
                out,
                "\"N{}\" [label=\"{}\\nid: {}, refCount: {}\", style=filled, fillcolor={}]",
                idx, node.name, idx, node.ref_count, colour
            );
        }
        out.push('\n');

        for idx in 0..self.nodes.len() {
            let mut valid = Vec::new();
            let mut culled = Vec::new();
            for edge in self.writer_edges(NodeId(idx)) {
                let target = format!("N{}", edge.to.0);
                if self.is_valid_edge(edge) {
                    valid.push(target);
                } else {
                    culled.push(target);
                }
            }
            if !valid.is_empty() {
                let _ = writeln!(out, "N{} -> {{ {} }} [color=red4]", idx, valid.join(" "));
            }
            if !culled.is_empty() {
                let _ = writeln!(out, "N{} -> {{ {} }} [color=red4 style=dashed]", idx, culled.join(" "));
            }
        }

        out.push_str("}\n");
        out
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // pass A -> res R -> pass B, plus pass C -> res S (never read)
    fn chain() -> (DependencyGraph, [NodeId; 5]) {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node("A", NodeKind::Pass);
        let r = graph.add_node("R", NodeKind::Resource);
        let b = graph.add_node("B", NodeKind::Pass);
        let c = graph.add_node("C", NodeKind::Pass);
        let s = graph.add_node("S", NodeKind::Resource);
        graph.add_edge(a, r, EdgeKind::Write, ImageUsage::COLOUR_ATTACHMENT);
        graph.add_edge(r, b, EdgeKind::Read, ImageUsage::SAMPLED);
        graph.add_edge(c, s, EdgeKind::Write, ImageUsage::COLOUR_ATTACHMENT);
        (graph, [a, r, b, c, s])
    }

    #[test]
    fn test_everything_culled_without_side_effect() {
        let (mut graph, ids) = chain();
        graph.cull();
        for id in ids {
            assert!(graph.node(id).is_culled(), "{} survived", graph.node(id).name());
        }
    }

    #[test]
    fn test_side_effect_keeps_producers() {
        let (mut graph, [a, r, b, c, s]) = chain();
        graph.declare_side_effect(b);
        graph.cull();
        assert!(!graph.node(a).is_culled());
        assert!(!graph.node(r).is_culled());
        assert!(!graph.node(b).is_culled());
        assert!(graph.node(c).is_culled());
        assert!(graph.node(s).is_culled());
    }

    #[test]
    fn test_cull_is_repeatable() {
        let (mut graph, [a, _, b, _, _]) = chain();
        graph.declare_side_effect(b);
        graph.cull();
        graph.cull();
        assert_eq!(graph.node(a).ref_count(), 1);
    }

    #[test]
    fn test_graphviz_dashes_culled_edges() {
        let (mut graph, [_, _, b, _, _]) = chain();
        graph.declare_side_effect(b);
        graph.cull();
        let dot = graph.export_graphviz();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("N0 -> { N1 } [color=red4]"));
        assert!(dot.contains("N3 -> { N4 } [color=red4 style=dashed]"));
    }
}
