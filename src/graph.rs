// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! DAG container and structural mutation operators
//!
//! [`Graph`] owns its nodes exclusively and keeps three invariants through
//! every mutation:
//!
//! 1. **No dangling references** - every id in a node's parent list resolves
//!    to a node in the graph.
//! 2. **No duplicate identities** - a node id appears at most once.
//! 3. **Acyclicity** - no node depends on itself, directly or transitively.
//!
//! Operators are atomic: they validate before committing, so a failed
//! mutation ([`Error::Structure`]/[`Error::Cycle`]) leaves the graph in its
//! last valid state and the search loop can retry with a different choice.
//!
//! The canonical structural fingerprint is [`Graph::descriptive_id`]: a
//! deterministic string built from node content and topology, stable under
//! node-identity changes. It drives population-level de-duplication and the
//! operations cache.
//!
//! For persistence, a graph round-trips through an ordered list of
//! [`NodeRecord`]s (`{id, content, parent_ids}`); `serde` support goes
//! through that record form and re-validates the invariants on
//! deserialization.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::node::{GraphNode, NodeContent, NodeId, NodePayload};

/// Optimizer-internal graph: structural content only, never fitted state.
pub type OptGraph = Graph<NodeContent>;

/// A directed acyclic graph of [`GraphNode`]s.
///
/// Edges point from parent (producer) to child (consumer) and are stored on
/// the child as an ordered parent list. Roots are nodes that no other node
/// consumes; a valid pipeline graph has exactly one.
#[derive(Debug, Clone)]
pub struct Graph<P> {
    nodes: Vec<GraphNode<P>>,
}

impl<P> Default for Graph<P> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<P: NodePayload> Graph<P> {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from detached nodes, validating all structural
    /// invariants.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] on duplicate ids or dangling parent references,
    /// [`Error::Cycle`] when the nodes do not form a DAG.
    pub fn from_nodes(nodes: Vec<GraphNode<P>>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            if !seen.insert(node.uid()) {
                return Err(Error::structure(format!(
                    "duplicate node id '{}' ('{}')",
                    node.uid(),
                    node.payload().name()
                )));
            }
        }
        for node in &nodes {
            for parent in node.nodes_from() {
                if !seen.contains(&parent) {
                    return Err(Error::structure(format!(
                        "node '{}' references parent '{parent}' which is not in the graph",
                        node.payload().name()
                    )));
                }
            }
        }
        let graph = Self { nodes };
        graph.topological_order()?;
        Ok(graph)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &GraphNode<P>> {
        self.nodes.iter()
    }

    /// Whether a node with this id is present.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.position(id).is_some()
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&GraphNode<P>> {
        self.position(id).map(|index| &self.nodes[index])
    }

    /// Mutable access to a node for content swaps. Parent lists are edited
    /// through the graph-level operators only.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut P> {
        let index = self.position(id)?;
        Some(self.nodes[index].payload_mut())
    }

    /// Ids of the nodes that list `id` as a parent, in insertion order.
    #[must_use]
    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.nodes_from().contains(id))
            .map(GraphNode::uid)
            .collect()
    }

    /// Ids of the nodes no other node consumes, in insertion order.
    #[must_use]
    pub fn root_nodes(&self) -> Vec<NodeId> {
        let mut referenced = HashSet::new();
        for node in &self.nodes {
            referenced.extend(node.nodes_from().iter());
        }
        self.nodes
            .iter()
            .map(GraphNode::uid)
            .filter(|id| !referenced.contains(id))
            .collect()
    }

    /// The single root of a pipeline-shaped graph.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] when the graph is empty or has several roots (a
    /// working graph mid-edit is not a valid candidate yet).
    pub fn root_node(&self) -> Result<&GraphNode<P>> {
        let roots = self.root_nodes();
        match roots.as_slice() {
            [single] => self.require(*single),
            [] => Err(Error::structure("graph has no root node")),
            _ => Err(Error::structure(format!(
                "expected exactly one root node, found {}",
                roots.len()
            ))),
        }
    }

    /// Longest root-to-leaf distance, in edges. A single node has depth 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut memo = HashMap::new();
        self.root_nodes()
            .into_iter()
            .map(|root| self.node_depth(root, &mut memo))
            .max()
            .unwrap_or(0)
    }

    fn node_depth(&self, id: NodeId, memo: &mut HashMap<NodeId, usize>) -> usize {
        if let Some(depth) = memo.get(&id) {
            return *depth;
        }
        let depth = match self.node(id) {
            Some(node) if !node.nodes_from().is_empty() => {
                1 + node
                    .nodes_from()
                    .iter()
                    .map(|parent| self.node_depth(parent, memo))
                    .max()
                    .unwrap_or(0)
            }
            _ => 0,
        };
        memo.insert(id, depth);
        depth
    }

    /// Node ids ordered so every parent precedes its children.
    ///
    /// # Errors
    ///
    /// [`Error::Cycle`] when the graph is not a DAG (only reachable through
    /// invariant-violating construction, e.g. corrupt persisted records).
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut pending: HashMap<NodeId, usize> = self
            .nodes
            .iter()
            .map(|node| (node.uid(), node.nodes_from().len()))
            .collect();
        let mut queue: VecDeque<NodeId> = self
            .nodes
            .iter()
            .filter(|node| node.nodes_from().is_empty())
            .map(GraphNode::uid)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for child in self.children_of(id) {
                if let Some(remaining) = pending.get_mut(&child) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .find(|node| !order.contains(&node.uid()))
                .map(|node| node.payload().name().to_string())
                .unwrap_or_default();
            return Err(Error::cycle(stuck.clone(), stuck));
        }
        Ok(order)
    }

    /// Canonical structural fingerprint of the whole graph.
    ///
    /// Built depth-first from the roots; each node contributes
    /// `({sorted parent ids})/label`. Stable under node-identity changes and
    /// parent insertion order, sensitive to topology and content.
    #[must_use]
    pub fn descriptive_id(&self) -> String {
        let mut parts: Vec<String> = self
            .root_nodes()
            .into_iter()
            .map(|root| self.descriptive_part(root))
            .collect();
        parts.sort();
        parts.join(";")
    }

    /// Structural fingerprint of the subgraph a single node depends on.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] when `id` is not in the graph.
    pub fn node_descriptive_id(&self, id: NodeId) -> Result<String> {
        self.require(id)?;
        Ok(self.descriptive_part(id))
    }

    fn descriptive_part(&self, id: NodeId) -> String {
        let Some(node) = self.node(id) else {
            return String::from("/?");
        };
        let label = node.payload().description();
        if node.nodes_from().is_empty() {
            return format!("/{label}");
        }
        let mut parents: Vec<String> = node
            .nodes_from()
            .iter()
            .map(|parent| format!("{};", self.descriptive_part(parent)))
            .collect();
        parents.sort();
        format!("({})/{label}", parents.concat())
    }

    /// Deep copy with fresh node identities. Topology, content, and
    /// therefore the descriptive id are preserved; node ids are not.
    #[must_use]
    pub fn copy(&self) -> Self {
        let mapping: HashMap<NodeId, NodeId> = self
            .nodes
            .iter()
            .map(|node| (node.uid(), NodeId::new()))
            .collect();
        let nodes = self
            .nodes
            .iter()
            .map(|node| {
                GraphNode::from_parts(
                    mapping[&node.uid()],
                    node.payload().clone(),
                    node.nodes_from().iter().map(|parent| mapping[&parent]).collect(),
                )
            })
            .collect();
        Self { nodes }
    }

    // ------------------------------------------------------------------
    // Structural operators
    // ------------------------------------------------------------------

    /// Insert a detached node. No-op when a node with the same id is already
    /// present.
    ///
    /// The node's parents must already be in the graph; a freshly inserted
    /// node has no children, so no cycle can result.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] on a dangling parent reference.
    pub fn add_node(&mut self, node: GraphNode<P>) -> Result<()> {
        if self.contains(node.uid()) {
            return Ok(());
        }
        for parent in node.nodes_from() {
            if !self.contains(parent) {
                return Err(Error::structure(format!(
                    "cannot add node '{}': parent '{parent}' is not in the graph",
                    node.payload().name()
                )));
            }
        }
        debug!(node = node.payload().name(), "graph.add_node");
        self.nodes.push(node);
        Ok(())
    }

    /// Merge a detached, self-contained graph (for example a freshly built
    /// subtree) into this one, keeping its node ids.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] when any incoming id is already present.
    pub fn add_subgraph(&mut self, other: Graph<P>) -> Result<()> {
        for node in &other.nodes {
            if self.contains(node.uid()) {
                return Err(Error::structure(format!(
                    "cannot merge subgraph: node id '{}' ('{}') is already present",
                    node.uid(),
                    node.payload().name()
                )));
            }
        }
        self.nodes.extend(other.nodes);
        Ok(())
    }

    /// Replace `old` with `new_node` in place: `new_node` inherits `old`'s
    /// children, while its own parent list is taken as given. Returns the
    /// replacement's id.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] when `old` is absent, the replacement's id
    /// collides with another node, or its parents dangle; [`Error::Cycle`]
    /// when one of its parents already depends on `old` (and would therefore
    /// depend on the replacement).
    pub fn update_node(&mut self, old: NodeId, new_node: GraphNode<P>) -> Result<NodeId> {
        let old_index = self
            .position(old)
            .ok_or_else(|| Error::structure(format!("cannot update: node '{old}' is not in the graph")))?;
        let new_id = new_node.uid();
        if new_id != old && self.contains(new_id) {
            return Err(Error::structure(format!(
                "cannot update: replacement id '{new_id}' is already in the graph"
            )));
        }
        for parent in new_node.nodes_from() {
            if parent == old {
                return Err(Error::structure(format!(
                    "replacement '{}' cannot list the node it replaces as a parent",
                    new_node.payload().name()
                )));
            }
            if !self.contains(parent) {
                return Err(Error::structure(format!(
                    "replacement '{}' references parent '{parent}' which is not in the graph",
                    new_node.payload().name()
                )));
            }
        }
        let downstream = self.descendants_of(old);
        for parent in new_node.nodes_from() {
            if downstream.contains(&parent) {
                return Err(Error::cycle(self.name_of(parent), new_node.payload().name()));
            }
        }
        debug!(
            old = self.nodes[old_index].payload().name(),
            new = new_node.payload().name(),
            "graph.update_node"
        );
        self.nodes[old_index] = new_node;
        for node in &mut self.nodes {
            node.nodes_from_mut().replace(old, new_id);
        }
        Ok(new_id)
    }

    /// Replace the subtree rooted at `old_root` (the root plus everything it
    /// exclusively depends on) with a detached single-root graph. Children
    /// of `old_root` are rewired to the new subtree's root, whose id is
    /// returned.
    ///
    /// Nodes the old subtree shared with another surviving path are kept.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] when `old_root` is absent, `subtree` does not
    /// have exactly one root, or its ids collide with the graph's.
    pub fn update_subtree(&mut self, old_root: NodeId, subtree: Graph<P>) -> Result<NodeId> {
        self.require(old_root)?;
        let new_root = subtree
            .root_node()
            .map_err(|_| Error::structure("replacement subtree must have exactly one root"))?
            .uid();
        for node in &subtree.nodes {
            if self.contains(node.uid()) {
                return Err(Error::structure(format!(
                    "cannot graft subtree: node id '{}' ('{}') is already present",
                    node.uid(),
                    node.payload().name()
                )));
            }
        }
        let removable = self.exclusive_subtree(old_root);
        let children = self.children_of(old_root);
        debug!(
            old_root = %self.name_of(old_root),
            new_root = subtree
                .node(new_root)
                .map(|node| node.payload().name())
                .unwrap_or_default(),
            replaced = removable.len(),
            "graph.update_subtree"
        );
        self.nodes.extend(subtree.nodes);
        for child in children {
            if let Some(index) = self.position(child) {
                self.nodes[index].nodes_from_mut().replace(old_root, new_root);
            }
        }
        self.nodes.retain(|node| !removable.contains(&node.uid()));
        Ok(new_root)
    }

    /// Remove a node, reconnecting each of its children directly to each of
    /// its parents (de-duplicated).
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] when the node is absent or it is the last node
    /// in the graph.
    pub fn delete_node(&mut self, id: NodeId) -> Result<()> {
        let index = self
            .position(id)
            .ok_or_else(|| Error::structure(format!("cannot delete: node '{id}' is not in the graph")))?;
        if self.nodes.len() == 1 {
            return Err(Error::structure(
                "cannot delete the last node: the graph must keep at least one node",
            ));
        }
        let parents: Vec<NodeId> = self.nodes[index].nodes_from().iter().collect();
        let children = self.children_of(id);
        debug!(node = self.nodes[index].payload().name(), "graph.delete_node");
        for child in &children {
            if let Some(child_index) = self.position(*child) {
                let list = self.nodes[child_index].nodes_from_mut();
                list.remove(id);
                for parent in &parents {
                    list.insert(*parent);
                }
            }
        }
        self.nodes.remove(index);
        Ok(())
    }

    /// Remove `root` and everything exclusively reachable through its
    /// dependency chain. Shared ancestors survive; children of `root` lose
    /// the edge but are not reconnected.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] when `root` is absent or removal would empty the
    /// graph.
    pub fn delete_subtree(&mut self, root: NodeId) -> Result<()> {
        self.require(root)?;
        let removable = self.exclusive_subtree(root);
        if removable.len() == self.nodes.len() {
            return Err(Error::structure(
                "cannot delete subtree: the graph must keep at least one node",
            ));
        }
        debug!(root = %self.name_of(root), removed = removable.len(), "graph.delete_subtree");
        for child in self.children_of(root) {
            if let Some(index) = self.position(child) {
                self.nodes[index].nodes_from_mut().remove(root);
            }
        }
        self.nodes.retain(|node| !removable.contains(&node.uid()));
        Ok(())
    }

    /// Add a single parent edge. No-op when the edge already exists.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] when either node is absent; [`Error::Cycle`]
    /// when `parent` is `child` itself or already depends on `child`.
    pub fn connect_nodes(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.require(parent)?;
        self.require(child)?;
        if parent == child {
            return Err(Error::cycle(self.name_of(parent), self.name_of(child)));
        }
        if self
            .node(child)
            .map(|node| node.nodes_from().contains(parent))
            .unwrap_or(false)
        {
            return Ok(());
        }
        if self.descendants_of(child).contains(&parent) {
            return Err(Error::cycle(self.name_of(parent), self.name_of(child)));
        }
        debug!(parent = %self.name_of(parent), child = %self.name_of(child), "graph.connect_nodes");
        if let Some(index) = self.position(child) {
            self.nodes[index].nodes_from_mut().insert(parent);
        }
        Ok(())
    }

    /// Remove a single parent edge. With `clean_up_leftovers`, a former
    /// parent left with no children is removed as well, cascading up its own
    /// parent chain, so repeated edits do not accumulate dangling unused
    /// nodes. The cascade never empties the graph.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] when either node is absent.
    pub fn disconnect_nodes(
        &mut self,
        parent: NodeId,
        child: NodeId,
        clean_up_leftovers: bool,
    ) -> Result<()> {
        self.require(parent)?;
        self.require(child)?;
        let removed = match self.position(child) {
            Some(index) => self.nodes[index].nodes_from_mut().remove(parent),
            None => false,
        };
        if removed && clean_up_leftovers {
            self.clean_up_leftovers(parent);
        }
        Ok(())
    }

    fn clean_up_leftovers(&mut self, id: NodeId) {
        if self.nodes.len() <= 1 || !self.children_of(id).is_empty() {
            return;
        }
        let Some(index) = self.position(id) else {
            return;
        };
        let parents: Vec<NodeId> = self.nodes[index].nodes_from().iter().collect();
        debug!(node = self.nodes[index].payload().name(), "graph.clean_up_leftovers");
        self.nodes.remove(index);
        for parent in parents {
            self.clean_up_leftovers(parent);
        }
    }

    // ------------------------------------------------------------------
    // Persistence records
    // ------------------------------------------------------------------

    /// Serialized form: ordered node records sufficient to reconstruct the
    /// DAG exactly (same ids, content, and topology).
    #[must_use]
    pub fn to_records(&self) -> Vec<NodeRecord<P>> {
        self.nodes
            .iter()
            .map(|node| NodeRecord {
                id: node.uid(),
                content: node.payload().clone(),
                parent_ids: node.nodes_from().iter().collect(),
            })
            .collect()
    }

    /// Rebuild a graph from its record form, re-validating every structural
    /// invariant.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] or [`Error::Cycle`] when the records do not
    /// describe a valid DAG.
    pub fn from_records(records: Vec<NodeRecord<P>>) -> Result<Self> {
        let nodes = records
            .into_iter()
            .map(|record| {
                GraphNode::from_parts(
                    record.id,
                    record.content,
                    record.parent_ids.into_iter().collect(),
                )
            })
            .collect();
        Self::from_nodes(nodes)
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn position(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|node| node.uid() == id)
    }

    fn require(&self, id: NodeId) -> Result<&GraphNode<P>> {
        self.node(id)
            .ok_or_else(|| Error::structure(format!("node '{id}' is not in the graph")))
    }

    fn name_of(&self, id: NodeId) -> String {
        self.node(id)
            .map(|node| node.payload().name().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    /// Everything `id` transitively depends on (its parents, their parents,
    /// and so on). Does not include `id` itself.
    fn ancestors_of(&self, id: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = self
            .node(id)
            .map(|node| node.nodes_from().iter().collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if seen.insert(current) {
                if let Some(node) = self.node(current) {
                    stack.extend(node.nodes_from().iter());
                }
            }
        }
        seen
    }

    /// Everything that transitively depends on `id`. Does not include `id`
    /// itself.
    fn descendants_of(&self, id: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = self.children_of(id);
        while let Some(current) = stack.pop() {
            if seen.insert(current) {
                stack.extend(self.children_of(current));
            }
        }
        seen
    }

    /// `root` plus the ancestors reachable only through nodes already being
    /// removed; ancestors shared with a surviving path are excluded.
    fn exclusive_subtree(&self, root: NodeId) -> HashSet<NodeId> {
        let candidates = self.ancestors_of(root);
        let mut removable: HashSet<NodeId> = HashSet::from([root]);
        loop {
            let mut changed = false;
            for candidate in &candidates {
                if removable.contains(candidate) {
                    continue;
                }
                let children = self.children_of(*candidate);
                if !children.is_empty() && children.iter().all(|child| removable.contains(child)) {
                    removable.insert(*candidate);
                    changed = true;
                }
            }
            if !changed {
                return removable;
            }
        }
    }
}

/// Structural equality: two graphs are equal when their descriptive ids
/// match, regardless of node identities.
impl<P: NodePayload> PartialEq for Graph<P> {
    fn eq(&self, other: &Self) -> bool {
        self.descriptive_id() == other.descriptive_id()
    }
}

impl<P: NodePayload> Eq for Graph<P> {}

/// One node in the serialized graph form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord<P> {
    /// Node identity, preserved exactly through a round-trip.
    pub id: NodeId,
    /// Node payload (operation name, params, metadata).
    pub content: P,
    /// Parent ids in insertion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_ids: Vec<NodeId>,
}

impl<P: NodePayload + Serialize> Serialize for Graph<P> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_records().serialize(serializer)
    }
}

impl<'de, P: NodePayload + Deserialize<'de>> Deserialize<'de> for Graph<P> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let records = Vec::<NodeRecord<P>>::deserialize(deserializer)?;
        Self::from_records(records).map_err(serde::de::Error::custom)
    }
}
