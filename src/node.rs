// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph nodes: identity, content, and ordered parent references
//!
//! A [`GraphNode`] couples a process-unique [`NodeId`] with an arbitrary
//! payload and a [`ParentList`] of the nodes it consumes. The node id is
//! opaque and stable across content mutation; it is never derived from the
//! node's content, so two structurally identical nodes in different graphs
//! always have distinct identities.
//!
//! The optimizer-side payload is [`NodeContent`]: an operation name plus
//! uninterpreted hyperparameters and metadata that the engine preserves
//! verbatim through adaptation, copying, and serialization.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process-unique, opaque identity of a graph node.
///
/// Stable across content mutation and parent-list edits. Not derived from
/// content: use [`Graph::descriptive_id`](crate::graph::Graph::descriptive_id)
/// for structural fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Mint a fresh id.
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structural content of an optimizer node: operation name plus verbatim
/// hyperparameters and metadata.
///
/// `params` and `metadata` are opaque to the engine. `BTreeMap` keeps their
/// iteration order deterministic so descriptive ids (and therefore cache
/// fingerprints) are reproducible across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContent {
    /// Operation name, as registered in the operation catalog.
    pub name: String,
    /// Hyperparameter mapping, preserved verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
    /// Uninterpreted annotations, preserved verbatim. Not part of the
    /// structural fingerprint.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NodeContent {
    /// Content with the given operation name and no params or metadata.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a hyperparameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Label used in descriptive ids: `n_{name}` for default params,
    /// `n_{name}_{params}` otherwise. Metadata is excluded: it annotates a
    /// node without changing what the operation computes.
    #[must_use]
    pub fn description(&self) -> String {
        if self.params.is_empty() {
            format!("n_{}", self.name)
        } else {
            let params = self
                .params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            format!("n_{}_{{{params}}}", self.name)
        }
    }
}

impl fmt::Display for NodeContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Payload of a graph node that contributes to the structural fingerprint.
pub trait NodePayload: Clone {
    /// Operation name.
    fn name(&self) -> &str;

    /// Per-node label used when building descriptive ids.
    fn description(&self) -> String;
}

impl NodePayload for NodeContent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        NodeContent::description(self)
    }
}

/// Insertion-ordered set of parent node ids.
///
/// Duplicate inserts are rejected structurally rather than checked ad hoc:
/// a parent list is a set with insertion order preserved for display, not
/// semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParentList {
    ids: Vec<NodeId>,
}

impl ParentList {
    /// Empty parent list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` at the end unless it is already present. Returns whether
    /// the list changed.
    pub fn insert(&mut self, id: NodeId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Remove `id`. Returns whether it was present.
    pub fn remove(&mut self, id: NodeId) -> bool {
        let before = self.ids.len();
        self.ids.retain(|other| *other != id);
        self.ids.len() != before
    }

    /// Replace `old` with `new`, keeping `old`'s position. When `new` is
    /// already present, `old` is simply removed. Returns whether `old` was
    /// present.
    pub(crate) fn replace(&mut self, old: NodeId, new: NodeId) -> bool {
        let Some(position) = self.ids.iter().position(|id| *id == old) else {
            return false;
        };
        if self.ids.contains(&new) {
            self.ids.remove(position);
        } else {
            self.ids[position] = new;
        }
        true
    }

    /// Whether `id` is present.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.ids.contains(&id)
    }

    /// Number of parents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Parents in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ids.iter().copied()
    }

    /// Parents in insertion order, as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[NodeId] {
        &self.ids
    }
}

impl FromIterator<NodeId> for ParentList {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut list = Self::new();
        for id in iter {
            list.insert(id);
        }
        list
    }
}

impl<'a> IntoIterator for &'a ParentList {
    type Item = NodeId;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, NodeId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter().copied()
    }
}

/// A node owned by a [`Graph`](crate::graph::Graph): a fresh identity, a
/// payload, and ordered references to the nodes it consumes.
///
/// Nodes are owned exclusively by one graph; moving a node between graphs
/// requires an explicit copy (which mints fresh ids).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode<P> {
    uid: NodeId,
    payload: P,
    nodes_from: ParentList,
}

impl<P> GraphNode<P> {
    /// Detached node with no parents and a fresh id.
    #[must_use]
    pub fn new(payload: P) -> Self {
        Self {
            uid: NodeId::new(),
            payload,
            nodes_from: ParentList::new(),
        }
    }

    /// Detached node with the given parents (de-duplicated, order
    /// preserved) and a fresh id.
    #[must_use]
    pub fn with_parents(payload: P, parents: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            uid: NodeId::new(),
            payload,
            nodes_from: parents.into_iter().collect(),
        }
    }

    pub(crate) fn from_parts(uid: NodeId, payload: P, nodes_from: ParentList) -> Self {
        Self {
            uid,
            payload,
            nodes_from,
        }
    }

    /// The node's identity.
    #[must_use]
    pub fn uid(&self) -> NodeId {
        self.uid
    }

    /// The node's payload.
    #[must_use]
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Mutable access to the payload (content swap). Parent edits go through
    /// the owning graph so structural invariants stay enforced.
    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    /// Ordered parent references.
    #[must_use]
    pub fn nodes_from(&self) -> &ParentList {
        &self.nodes_from
    }

    pub(crate) fn nodes_from_mut(&mut self) -> &mut ParentList {
        &mut self.nodes_from
    }

    /// Whether this node consumes raw input directly (no parents).
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.nodes_from.is_empty()
    }
}

/// Optimizer-side node: structural content only, never fitted state.
pub type OptNode = GraphNode<NodeContent>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_ids_are_unique() {
        let a = OptNode::new(NodeContent::new("pca"));
        let b = OptNode::new(NodeContent::new("pca"));
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn test_parent_list_rejects_duplicates() {
        let a = NodeId::new();
        let b = NodeId::new();
        let mut parents = ParentList::new();
        assert!(parents.insert(a));
        assert!(parents.insert(b));
        assert!(!parents.insert(a));
        assert_eq!(parents.len(), 2);
        assert_eq!(parents.as_slice(), &[a, b]);
    }

    #[test]
    fn test_parent_list_replace_keeps_position() {
        let a = NodeId::new();
        let b = NodeId::new();
        let c = NodeId::new();
        let mut parents: ParentList = [a, b].into_iter().collect();

        assert!(parents.replace(a, c));
        assert_eq!(parents.as_slice(), &[c, b]);

        // Replacing with an id that is already present collapses to removal.
        assert!(parents.replace(c, b));
        assert_eq!(parents.as_slice(), &[b]);
    }

    #[test]
    fn test_with_parents_deduplicates() {
        let a = NodeId::new();
        let node = OptNode::with_parents(NodeContent::new("rf"), [a, a]);
        assert_eq!(node.nodes_from().len(), 1);
        assert!(!node.is_primary());
    }

    #[test]
    fn test_description_without_params() {
        let content = NodeContent::new("scaling");
        assert_eq!(content.description(), "n_scaling");
    }

    #[test]
    fn test_description_with_params_is_deterministic() {
        let content = NodeContent::new("pca")
            .with_param("svd_solver", json!("full"))
            .with_param("n_components", json!(0.7));
        assert_eq!(
            content.description(),
            "n_pca_{n_components=0.7,svd_solver=\"full\"}"
        );
    }

    #[test]
    fn test_description_ignores_metadata() {
        let plain = NodeContent::new("rf");
        let annotated = NodeContent::new("rf").with_metadata("origin", json!("mutation"));
        assert_eq!(plain.description(), annotated.description());
    }

    #[test]
    fn test_content_serde_preserves_params_verbatim() {
        let content = NodeContent::new("xgboost")
            .with_param("max_depth", json!(3))
            .with_metadata("note", json!({"nested": [1, 2]}));
        let encoded = serde_json::to_string(&content).unwrap();
        let decoded: NodeContent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, content);
    }
}
