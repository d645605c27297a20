// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Pipeline ↔ optimizer-graph translation
//!
//! [`PipelineAdapter`] keeps the two representations of a candidate
//! synchronized without ever aliasing them: `adapt` re-derives a
//! structural-only [`OptGraph`](crate::graph::OptGraph) from a domain
//! [`Pipeline`] (fitted state stripped, topology preserved), and `restore`
//! rebuilds role-tagged domain nodes from optimizer nodes in a single
//! bottom-up pass. Both directions mint fresh node objects, so mutating one
//! representation can never observably mutate the other.
//!
//! The round-trip is lossless under the structural fingerprint:
//! `restore(adapt(p))` has the same `descriptive_id` as `p`.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;
use crate::graph::{Graph, OptGraph};
use crate::node::{GraphNode, NodeId};
use crate::pipeline::{Pipeline, PipelineNode};

/// Run-level metadata attached to a restored pipeline as a whole, not to
/// individual nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunMetadata {
    /// Elapsed fit/evaluation time of the candidate, when known.
    pub computation_time: Option<Duration>,
}

impl RunMetadata {
    /// Empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how long the candidate's computation took.
    #[must_use]
    pub fn with_computation_time(mut self, computation_time: Duration) -> Self {
        self.computation_time = Some(computation_time);
        self
    }
}

/// Stateless bidirectional translator between the domain pipeline and the
/// optimizer-internal graph. Keeps no cross-references between the two
/// representations; correspondence is re-derived on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineAdapter;

impl PipelineAdapter {
    /// New adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Translate a domain pipeline into an optimizer graph.
    ///
    /// Every node becomes a structural-only optimizer node carrying
    /// `{name, params, metadata}`; fitted runtime state is dropped, the
    /// parent topology is preserved exactly, and all nodes are fresh
    /// objects.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`](crate::Error::Structure) when the pipeline's
    /// graph is malformed - a programming-error-class failure for pipelines
    /// that passed construction-time validation.
    pub fn adapt(&self, pipeline: &Pipeline) -> Result<OptGraph> {
        let mapping = Self::fresh_ids(pipeline.graph().iter().map(GraphNode::uid));
        let nodes = pipeline
            .graph()
            .iter()
            .map(|node| {
                GraphNode::from_parts(
                    mapping[&node.uid()],
                    node.payload().content().clone(),
                    node.nodes_from().iter().map(|parent| mapping[&parent]).collect(),
                )
            })
            .collect();
        Graph::from_nodes(nodes)
    }

    /// Rebuild a domain pipeline from an optimizer graph.
    ///
    /// A node with no parents becomes a primary-role node; a node with one
    /// or more parents becomes a secondary-role node. Restoration is a
    /// single bottom-up pass: validation of the rebuilt graph guarantees
    /// every node's parents are restored alongside it. `metadata` lands on
    /// the pipeline as a whole.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`](crate::Error::Structure) when the optimizer
    /// graph is not a valid single-root pipeline (for example mid-edit,
    /// still disconnected).
    pub fn restore(&self, opt_graph: &OptGraph, metadata: RunMetadata) -> Result<Pipeline> {
        let mapping = Self::fresh_ids(opt_graph.iter().map(GraphNode::uid));
        let nodes = opt_graph
            .iter()
            .map(|node| {
                let content = node.payload().clone();
                let payload = if node.nodes_from().is_empty() {
                    PipelineNode::primary(content)
                } else {
                    PipelineNode::secondary(content)
                };
                GraphNode::from_parts(
                    mapping[&node.uid()],
                    payload,
                    node.nodes_from().iter().map(|parent| mapping[&parent]).collect(),
                )
            })
            .collect();
        let pipeline = Pipeline::new(Graph::from_nodes(nodes)?)?;
        Ok(pipeline.with_computation_time(metadata.computation_time))
    }

    fn fresh_ids(ids: impl Iterator<Item = NodeId>) -> HashMap<NodeId, NodeId> {
        ids.map(|id| (id, NodeId::new())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeContent, OptNode};
    use crate::pipeline::FittedOperation;
    use serde_json::json;

    fn sample_pipeline() -> Pipeline {
        let scaling = GraphNode::new(PipelineNode::primary(
            NodeContent::new("scaling").with_param("with_mean", json!(true)),
        ));
        let pca = GraphNode::new(PipelineNode::primary(
            NodeContent::new("pca").with_metadata("source", json!("preset")),
        ));
        let rf = GraphNode::with_parents(
            PipelineNode::secondary(NodeContent::new("rf")),
            [scaling.uid(), pca.uid()],
        );
        Pipeline::from_nodes(vec![scaling, pca, rf]).unwrap()
    }

    #[test]
    fn test_round_trip_preserves_descriptive_id() {
        let pipeline = sample_pipeline();
        let adapter = PipelineAdapter::new();

        let opt_graph = adapter.adapt(&pipeline).unwrap();
        let restored = adapter.restore(&opt_graph, RunMetadata::new()).unwrap();

        assert_eq!(restored.descriptive_id(), pipeline.descriptive_id());
    }

    #[test]
    fn test_round_trip_mints_fresh_node_identities() {
        let pipeline = sample_pipeline();
        let adapter = PipelineAdapter::new();

        let opt_graph = adapter.adapt(&pipeline).unwrap();
        for node in opt_graph.iter() {
            assert!(pipeline.graph().node(node.uid()).is_none());
        }

        let restored = adapter.restore(&opt_graph, RunMetadata::new()).unwrap();
        for node in restored.graph().iter() {
            assert!(opt_graph.node(node.uid()).is_none());
        }
    }

    #[test]
    fn test_adapt_strips_fitted_state() {
        let pipeline = sample_pipeline();
        let fitter = |operation: &NodeContent, _fold: Option<u32>| -> Result<FittedOperation> {
            Ok(FittedOperation::new(operation.name.clone(), vec![42]))
        };
        let fitted = pipeline.fit(&fitter, None, None).unwrap();
        assert!(fitted.is_fitted());

        let adapter = PipelineAdapter::new();
        let opt_graph = adapter.adapt(&fitted).unwrap();
        let restored = adapter.restore(&opt_graph, RunMetadata::new()).unwrap();

        // Optimizer nodes carry structural content only, so nothing fitted
        // can survive the trip.
        assert!(!restored.is_fitted());
        assert_eq!(restored.descriptive_id(), fitted.descriptive_id());
    }

    #[test]
    fn test_params_and_metadata_survive_verbatim() {
        let pipeline = sample_pipeline();
        let adapter = PipelineAdapter::new();
        let restored = adapter
            .restore(&adapter.adapt(&pipeline).unwrap(), RunMetadata::new())
            .unwrap();

        let find = |p: &Pipeline, name: &str| {
            p.graph()
                .iter()
                .find(|node| node.payload().content().name == name)
                .unwrap()
                .payload()
                .content()
                .clone()
        };
        assert_eq!(find(&restored, "scaling"), find(&pipeline, "scaling"));
        assert_eq!(find(&restored, "pca"), find(&pipeline, "pca"));
    }

    #[test]
    fn test_restore_assigns_roles_from_parent_presence() {
        let pipeline = sample_pipeline();
        let adapter = PipelineAdapter::new();
        let restored = adapter
            .restore(&adapter.adapt(&pipeline).unwrap(), RunMetadata::new())
            .unwrap();

        for node in restored.graph().iter() {
            assert_eq!(node.payload().is_primary_role(), node.nodes_from().is_empty());
        }
    }

    #[test]
    fn test_restore_attaches_run_metadata_to_pipeline() {
        let pipeline = sample_pipeline();
        let adapter = PipelineAdapter::new();
        let opt_graph = adapter.adapt(&pipeline).unwrap();

        let metadata = RunMetadata::new().with_computation_time(Duration::from_millis(1500));
        let restored = adapter.restore(&opt_graph, metadata).unwrap();
        assert_eq!(restored.computation_time(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_restore_rejects_disconnected_working_graph() {
        // Two roots: still mid-edit, not a valid candidate.
        let a = OptNode::new(NodeContent::new("a"));
        let b = OptNode::new(NodeContent::new("b"));
        let graph = Graph::from_nodes(vec![a, b]).unwrap();

        let adapter = PipelineAdapter::new();
        let result = adapter.restore(&graph, RunMetadata::new());
        assert!(matches!(result, Err(crate::Error::Structure { .. })));
    }
}
