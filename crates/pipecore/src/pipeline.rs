//! Arena-backed composition tree.
//!
//! A [`Pipeline`] owns every node it creates. Composites refer to their
//! children by [`NodeId`]; each node records at most one parent, which is
//! how exclusive ownership is checked at link time.

use crate::{Completion, Metadata, NodeContext, NodeKind, StructuralError, Task, TaskConfig, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;

/// Index of a node inside its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What `link` does with a child whose name is already present in the parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Leave the existing child in place and skip the new one
    #[default]
    Skip,
    /// Fail with [`StructuralError::DuplicateChild`]
    Reject,
}

/// Successor chain of a sequential composite.
#[derive(Debug, Default)]
pub struct Chain {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    successors: HashMap<NodeId, NodeId>,
}

impl Chain {
    fn push(&mut self, id: NodeId) {
        match self.tail {
            Some(tail) => {
                self.successors.insert(tail, id);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    pub fn tail(&self) -> Option<NodeId> {
        self.tail
    }

    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        self.successors.get(&id).copied()
    }

    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            next: self.head,
        }
    }
}

pub struct ChainIter<'a> {
    chain: &'a Chain,
    next: Option<NodeId>,
}

impl Iterator for ChainIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.next?;
        self.next = self.chain.successor(current);
        Some(current)
    }
}

#[derive(Debug)]
enum Links {
    Leaf,
    Chain(Chain),
    Members(Vec<NodeId>),
}

/// Mutable part of a node, locked while the node runs.
pub struct NodeCell {
    /// `None` for composites
    pub task: Option<Box<dyn Task>>,
    pub ctx: NodeContext,
}

pub struct NodeSlot {
    name: String,
    kind: NodeKind,
    task_type: Option<String>,
    parent: Option<NodeId>,
    /// Left detached by a skipped duplicate link
    skipped: bool,
    links: Links,
    completion: Completion,
    cell: Mutex<NodeCell>,
}

impl NodeSlot {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn task_type(&self) -> Option<&str> {
        self.task_type.as_deref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_set()
    }

    pub fn cell(&self) -> &Mutex<NodeCell> {
        &self.cell
    }

    /// The successor chain, for sequential composites.
    pub fn chain(&self) -> Option<&Chain> {
        match &self.links {
            Links::Chain(chain) => Some(chain),
            _ => None,
        }
    }
}

pub struct Pipeline {
    name: String,
    nodes: Vec<NodeSlot>,
    root: Option<NodeId>,
    policy: DuplicatePolicy,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            root: None,
            policy: DuplicatePolicy::default(),
        }
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_task(
        &mut self,
        name: &str,
        task: Box<dyn Task>,
        config: TaskConfig,
    ) -> Result<NodeId, StructuralError> {
        let task_type = task.task_type().to_string();
        self.insert(name, NodeKind::Task, Some(task_type), Some(task), config)
    }

    pub fn add_sequential(&mut self, name: &str) -> Result<NodeId, StructuralError> {
        self.add_composite(name, NodeKind::Sequential, TaskConfig::default())
    }

    pub fn add_parallel(&mut self, name: &str) -> Result<NodeId, StructuralError> {
        self.add_composite(name, NodeKind::Parallel, TaskConfig::default())
    }

    pub fn add_composite(
        &mut self,
        name: &str,
        kind: NodeKind,
        config: TaskConfig,
    ) -> Result<NodeId, StructuralError> {
        if !kind.is_composite() {
            return Err(StructuralError::InvalidName(format!(
                "{} (composite kind required)",
                name
            )));
        }
        self.insert(name, kind, None, None, config)
    }

    fn insert(
        &mut self,
        name: &str,
        kind: NodeKind,
        task_type: Option<String>,
        task: Option<Box<dyn Task>>,
        config: TaskConfig,
    ) -> Result<NodeId, StructuralError> {
        let name = normalize_name(name)?;
        let links = match kind {
            NodeKind::Task => Links::Leaf,
            NodeKind::Sequential => Links::Chain(Chain::default()),
            NodeKind::Parallel => Links::Members(Vec::new()),
        };
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeSlot {
            cell: Mutex::new(NodeCell {
                task,
                ctx: NodeContext::new(name.clone(), config),
            }),
            name,
            kind,
            task_type,
            parent: None,
            skipped: false,
            links,
            completion: Completion::new(),
        });
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeSlot, StructuralError> {
        self.nodes
            .get(id.0)
            .ok_or(StructuralError::UnknownNode(id.0))
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Explicit root if one was set, otherwise the first unowned composite,
    /// otherwise the first unowned node. Nodes left detached by a skipped
    /// duplicate link are never picked.
    pub fn root(&self) -> Option<NodeId> {
        self.root.or_else(|| {
            let unowned = || {
                self.ids().filter(move |id| {
                    let slot = &self.nodes[id.0];
                    slot.parent.is_none() && !slot.skipped
                })
            };
            unowned()
                .find(|id| self.nodes[id.0].kind.is_composite())
                .or_else(|| unowned().next())
        })
    }

    pub fn set_root(&mut self, id: NodeId) -> Result<(), StructuralError> {
        self.node(id)?;
        self.root = Some(id);
        Ok(())
    }

    /// Append `children` to the composite `parent`, in order.
    ///
    /// The whole call is validated before anything is attached. Returns the
    /// number of children actually linked (duplicates skipped under
    /// [`DuplicatePolicy::Skip`] are not counted).
    pub fn link(&mut self, parent: NodeId, children: &[NodeId]) -> Result<usize, StructuralError> {
        let parent_slot = self.node(parent)?;
        if !parent_slot.kind.is_composite() {
            return Err(StructuralError::NotComposite(parent_slot.name.clone()));
        }

        let mut names: Vec<&str> = self
            .children(parent)
            .into_iter()
            .map(|id| self.nodes[id.0].name.as_str())
            .collect();
        let mut plan: Vec<NodeId> = Vec::new();
        let mut skipped: Vec<NodeId> = Vec::new();

        for &child in children {
            let slot = self.node(child)?;
            if child == parent || self.is_ancestor(child, parent) {
                return Err(StructuralError::Cycle {
                    child: slot.name.clone(),
                    parent: self.full_name(parent),
                });
            }
            match slot.parent {
                Some(owner) if owner != parent => {
                    return Err(StructuralError::AlreadyOwned {
                        child: slot.name.clone(),
                        parent: self.full_name(owner),
                    });
                }
                _ => {}
            }

            let duplicate = slot.parent == Some(parent)
                || plan.contains(&child)
                || names.contains(&slot.name.as_str());
            if duplicate {
                match self.policy {
                    DuplicatePolicy::Skip => {
                        tracing::debug!(
                            composite = %self.full_name(parent),
                            child = %slot.name,
                            "child already present, skipping"
                        );
                        if slot.parent.is_none() {
                            skipped.push(child);
                        }
                        continue;
                    }
                    DuplicatePolicy::Reject => {
                        return Err(StructuralError::DuplicateChild {
                            composite: self.full_name(parent),
                            child: slot.name.clone(),
                        });
                    }
                }
            }

            names.push(slot.name.as_str());
            plan.push(child);
        }

        drop(names);
        for child in skipped {
            self.nodes[child.0].skipped = true;
        }
        let linked = plan.len();
        for child in plan {
            self.nodes[child.0].parent = Some(parent);
            self.nodes[child.0].skipped = false;
            match &mut self.nodes[parent.0].links {
                Links::Chain(chain) => chain.push(child),
                Links::Members(members) => members.push(child),
                Links::Leaf => unreachable!("parent kind checked above"),
            }
        }
        Ok(linked)
    }

    /// Direct children: chain order for sequential composites, link order
    /// for parallel ones, empty for tasks.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        match self.nodes.get(id.0).map(|slot| &slot.links) {
            Some(Links::Chain(chain)) => chain.iter().collect(),
            Some(Links::Members(members)) => members.clone(),
            _ => Vec::new(),
        }
    }

    pub fn head(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0)?.chain()?.head()
    }

    pub fn tail(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0)?.chain()?.tail()
    }

    /// Next sibling of `id` in its parent's chain.
    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.nodes.get(id.0)?.parent?;
        self.nodes[parent.0].chain()?.successor(id)
    }

    /// True if `ancestor` lies on the parent chain of `id`.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = self.nodes.get(id.0).and_then(|slot| slot.parent);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.nodes[p.0].parent;
        }
        false
    }

    /// Dotted name from the top of the tree, e.g. `all_stats.mean_2`.
    pub fn full_name(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current.and_then(|c| self.nodes.get(c.0)) {
            parts.push(node.name.as_str());
            current = node.parent;
        }
        parts.reverse();
        parts.join(".")
    }

    pub fn find(&self, full_name: &str) -> Option<NodeId> {
        self.ids().find(|&id| self.full_name(id) == full_name)
    }

    pub fn is_completed(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).is_some_and(NodeSlot::is_completed)
    }

    /// Set the input slot of a node before running.
    pub fn set_input(&mut self, id: NodeId, input: Value) -> Result<(), StructuralError> {
        let slot = self
            .nodes
            .get_mut(id.0)
            .ok_or(StructuralError::UnknownNode(id.0))?;
        slot.cell.get_mut().ctx.input = input;
        Ok(())
    }

    pub async fn output(&self, id: NodeId) -> Result<Value, StructuralError> {
        Ok(self.node(id)?.cell.lock().await.ctx.output.clone())
    }

    /// Start a new run: clear completion flags, outputs and metadata.
    /// Inputs are kept.
    pub fn reset(&mut self) {
        for slot in &mut self.nodes {
            slot.completion.reset();
            let ctx = &mut slot.cell.get_mut().ctx;
            ctx.output = Value::Null;
            ctx.metadata.clear();
        }
    }

    /// Metadata of every node, keyed as `full:name:with:colons.item`.
    pub async fn full_metadata(&self) -> Metadata {
        let mut full = Metadata::new();
        for id in self.ids() {
            let prefix = self.full_name(id).replace('.', ":");
            let cell = self.nodes[id.0].cell.lock().await;
            full.extend_prefixed(&prefix, &cell.ctx.metadata);
        }
        full
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("root", &self.root())
            .field("policy", &self.policy)
            .finish()
    }
}

fn normalize_name(name: &str) -> Result<String, StructuralError> {
    let name: String = name
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    if name.is_empty() || name.contains('.') {
        return Err(StructuralError::InvalidName(name));
    }
    Ok(name)
}
