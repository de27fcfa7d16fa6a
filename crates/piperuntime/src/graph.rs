//! Read-only structural views of a composition tree.
//!
//! Everything here is derived from the pipeline on each call; nothing is
//! cached or written back.

use petgraph::graph::{DiGraph, NodeIndex};
use pipecore::{NodeId, NodeKind, Pipeline};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

/// One node in depth-first order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatEntry {
    pub full_name: String,
    pub id: NodeId,
    pub kind: NodeKind,
    pub depth: usize,
}

/// All nodes under `root` (inclusive), composite before its children.
pub fn flatten(pipeline: &Pipeline, root: NodeId) -> Vec<FlatEntry> {
    let mut entries = Vec::new();
    let mut stack = vec![(root, 0usize)];

    while let Some((id, depth)) = stack.pop() {
        let Ok(slot) = pipeline.node(id) else {
            continue;
        };
        entries.push(FlatEntry {
            full_name: pipeline.full_name(id),
            id,
            kind: slot.kind(),
            depth,
        });
        for child in pipeline.children(id).into_iter().rev() {
            stack.push((child, depth + 1));
        }
    }

    entries
}

/// Indented rendering of the tree.
///
/// Children of sequential composites are marked `->`, children of parallel
/// composites `||`. Tasks show their type in brackets; completed nodes end
/// with `*`.
pub fn ascii_tree(pipeline: &Pipeline, root: NodeId) -> String {
    let mut out = String::new();

    for entry in flatten(pipeline, root) {
        let Ok(slot) = pipeline.node(entry.id) else {
            continue;
        };
        let marker = match slot.parent().and_then(|p| pipeline.node(p).ok()) {
            Some(parent) if parent.kind() == NodeKind::Parallel => "|| ",
            Some(_) => "-> ",
            None => "",
        };
        let label = match slot.task_type() {
            Some(task_type) => format!("{} [{}]", slot.name(), task_type),
            None => format!("{} ({})", slot.name(), slot.kind()),
        };
        let done = if slot.is_completed() { " *" } else { "" };

        let _ = writeln!(
            out,
            "{}{}{}{}",
            "   ".repeat(entry.depth),
            marker,
            label,
            done
        );
    }

    out
}

/// Vertex of the edge list: a task, or the synthetic entry of a composite
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphNode {
    Task { name: String },
    Entry { composite: String, kind: NodeKind },
}

impl GraphNode {
    fn for_node(pipeline: &Pipeline, id: NodeId) -> Option<Self> {
        let slot = pipeline.node(id).ok()?;
        let name = pipeline.full_name(id);
        Some(if slot.kind().is_composite() {
            GraphNode::Entry {
                composite: name,
                kind: slot.kind(),
            }
        } else {
            GraphNode::Task { name }
        })
    }
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphNode::Task { name } => f.write_str(name),
            GraphNode::Entry { composite, .. } => write!(f, "{}:entry", composite),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// `from` is followed by `to` inside a sequential composite
    Successor,
    /// A composite's entry leads into one of its children
    Enters,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EdgeKind::Successor => "successor",
            EdgeKind::Enters => "enters",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: GraphNode,
    pub to: GraphNode,
    pub kind: EdgeKind,
}

/// Edge list of the subtree under `root`.
///
/// Composites appear only as `Entry` pseudo-nodes. A sequential composite
/// enters its head and chains its children by `Successor` edges; a parallel
/// composite enters every member.
pub fn edge_list(pipeline: &Pipeline, root: NodeId) -> Vec<Edge> {
    let mut edges = Vec::new();

    for entry in flatten(pipeline, root) {
        let Some(from) = GraphNode::for_node(pipeline, entry.id) else {
            continue;
        };
        match entry.kind {
            NodeKind::Task => {}
            NodeKind::Sequential => {
                let chain = pipeline.children(entry.id);
                if let Some(to) = chain.first().and_then(|&h| GraphNode::for_node(pipeline, h)) {
                    edges.push(Edge {
                        from: from.clone(),
                        to,
                        kind: EdgeKind::Enters,
                    });
                }
                for pair in chain.windows(2) {
                    let (Some(a), Some(b)) = (
                        GraphNode::for_node(pipeline, pair[0]),
                        GraphNode::for_node(pipeline, pair[1]),
                    ) else {
                        continue;
                    };
                    edges.push(Edge {
                        from: a,
                        to: b,
                        kind: EdgeKind::Successor,
                    });
                }
            }
            NodeKind::Parallel => {
                for member in pipeline.children(entry.id) {
                    if let Some(to) = GraphNode::for_node(pipeline, member) {
                        edges.push(Edge {
                            from: from.clone(),
                            to,
                            kind: EdgeKind::Enters,
                        });
                    }
                }
            }
        }
    }

    edges
}

/// Build a petgraph graph of the subtree under `root`.
///
/// Every node reachable from `root` becomes a vertex, even a lone task with
/// no edges.
pub fn to_graph(pipeline: &Pipeline, root: NodeId) -> DiGraph<GraphNode, EdgeKind> {
    let mut graph = DiGraph::new();
    let mut index: HashMap<GraphNode, NodeIndex> = HashMap::new();

    for entry in flatten(pipeline, root) {
        if let Some(node) = GraphNode::for_node(pipeline, entry.id) {
            index
                .entry(node.clone())
                .or_insert_with(|| graph.add_node(node));
        }
    }

    for edge in edge_list(pipeline, root) {
        if let (Some(&a), Some(&b)) = (index.get(&edge.from), index.get(&edge.to)) {
            graph.add_edge(a, b, edge.kind);
        }
    }

    graph
}
