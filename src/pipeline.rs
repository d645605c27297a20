// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Domain pipeline: role-tagged operation nodes with fitted runtime state
//!
//! A [`Pipeline`] is the domain-side view of a candidate: the same DAG the
//! optimizer mutates, but with each node tagged [`PipelineNode::Primary`]
//! (no parents, consumes raw input) or [`PipelineNode::Secondary`] (consumes
//! upstream outputs) and optionally carrying a fitted artifact. Pipelines
//! are immutable after construction - structural mutation happens on the
//! optimizer graph, and fitting returns a new pipeline.
//!
//! Fitting walks nodes in topological order and consults the
//! [`OperationsCache`] with each node's subtree fingerprint before invoking
//! the external [`OperationFitter`] collaborator, so overlapping subgraphs
//! across a population are fitted at most once per fold.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheKey, OperationsCache};
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::node::{GraphNode, NodeContent, NodePayload};

/// Opaque fitted-operation artifact produced by the fitting collaborator.
///
/// Immutable once created; shared by reference ([`Arc`]) between the cache
/// and fitted pipelines. The byte length of the payload is the weight used
/// for cache eviction accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittedOperation {
    operation: String,
    payload: Vec<u8>,
}

impl FittedOperation {
    /// Wrap a fitted artifact for the named operation.
    #[must_use]
    pub fn new(operation: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            operation: operation.into(),
            payload,
        }
    }

    /// Operation name this artifact was fitted for.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The opaque artifact bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Approximate size used for cache eviction accounting.
    #[must_use]
    pub fn weight(&self) -> u64 {
        (self.operation.len() + self.payload.len()) as u64
    }
}

/// Domain node: structural content plus role tag and fitted runtime state.
///
/// The role is fixed at construction and must agree with the node's place in
/// the owning graph: a `Primary` node has no parents, a `Secondary` node has
/// at least one. [`Pipeline::new`] enforces the agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineNode {
    /// Consumes raw input data directly; no parents.
    Primary {
        /// Operation name, params, and metadata.
        content: NodeContent,
        /// Fitted artifact, present after a successful fit.
        fitted: Option<Arc<FittedOperation>>,
    },
    /// Consumes the outputs of one or more upstream nodes.
    Secondary {
        /// Operation name, params, and metadata.
        content: NodeContent,
        /// Fitted artifact, present after a successful fit.
        fitted: Option<Arc<FittedOperation>>,
    },
}

impl PipelineNode {
    /// Unfitted primary node.
    #[must_use]
    pub fn primary(content: NodeContent) -> Self {
        Self::Primary {
            content,
            fitted: None,
        }
    }

    /// Unfitted secondary node.
    #[must_use]
    pub fn secondary(content: NodeContent) -> Self {
        Self::Secondary {
            content,
            fitted: None,
        }
    }

    /// Structural content (name, params, metadata).
    #[must_use]
    pub fn content(&self) -> &NodeContent {
        match self {
            Self::Primary { content, .. } | Self::Secondary { content, .. } => content,
        }
    }

    /// Fitted artifact, when present.
    #[must_use]
    pub fn fitted(&self) -> Option<&Arc<FittedOperation>> {
        match self {
            Self::Primary { fitted, .. } | Self::Secondary { fitted, .. } => fitted.as_ref(),
        }
    }

    /// Whether this is a primary-role node.
    #[must_use]
    pub fn is_primary_role(&self) -> bool {
        matches!(self, Self::Primary { .. })
    }

    pub(crate) fn set_fitted(&mut self, artifact: Arc<FittedOperation>) {
        match self {
            Self::Primary { fitted, .. } | Self::Secondary { fitted, .. } => {
                *fitted = Some(artifact);
            }
        }
    }
}

impl NodePayload for PipelineNode {
    fn name(&self) -> &str {
        &self.content().name
    }

    fn description(&self) -> String {
        self.content().description()
    }
}

/// Fitting collaborator: fits a single operation on (externally held) data
/// for one fold. Wrapped by the operations cache during pipeline fit.
pub trait OperationFitter: Send + Sync {
    /// Fit one operation. `fold` identifies the cross-validation partition,
    /// `None` for a fit on the full training set.
    ///
    /// # Errors
    ///
    /// Any error is reported as a failed candidate score by the evaluation
    /// layer; it never aborts a generation.
    fn fit(&self, operation: &NodeContent, fold: Option<u32>) -> Result<FittedOperation>;
}

impl<F> OperationFitter for F
where
    F: Fn(&NodeContent, Option<u32>) -> Result<FittedOperation> + Send + Sync,
{
    fn fit(&self, operation: &NodeContent, fold: Option<u32>) -> Result<FittedOperation> {
        self(operation, fold)
    }
}

/// A domain pipeline: a single-root DAG of role-tagged operation nodes.
///
/// Validated on construction: exactly one root, roles consistent with the
/// topology. Immutable afterwards; [`Pipeline::fit`] returns a new fitted
/// pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    graph: Graph<PipelineNode>,
    computation_time: Option<Duration>,
}

/// Structural equality, as for [`Graph`]: run metadata and fitted state do
/// not participate.
impl PartialEq for Pipeline {
    fn eq(&self, other: &Self) -> bool {
        self.graph == other.graph
    }
}

impl Eq for Pipeline {}

impl Pipeline {
    /// Wrap a validated graph as a pipeline.
    ///
    /// # Errors
    ///
    /// [`Error::Structure`] when the graph does not have exactly one root or
    /// a node's role disagrees with its parent count.
    pub fn new(graph: Graph<PipelineNode>) -> Result<Self> {
        graph.root_node()?;
        for node in graph.iter() {
            let structural_primary = node.nodes_from().is_empty();
            if structural_primary != node.payload().is_primary_role() {
                let role = if node.payload().is_primary_role() {
                    "primary"
                } else {
                    "secondary"
                };
                return Err(Error::structure(format!(
                    "node '{}' is tagged {role} but has {} parent(s)",
                    node.payload().name(),
                    node.nodes_from().len()
                )));
            }
        }
        Ok(Self {
            graph,
            computation_time: None,
        })
    }

    /// Build a pipeline directly from detached nodes.
    ///
    /// # Errors
    ///
    /// As [`Graph::from_nodes`] and [`Pipeline::new`].
    pub fn from_nodes(nodes: Vec<GraphNode<PipelineNode>>) -> Result<Self> {
        Self::new(Graph::from_nodes(nodes)?)
    }

    /// Attach run metadata: how long the candidate's evaluation took.
    #[must_use]
    pub fn with_computation_time(mut self, computation_time: Option<Duration>) -> Self {
        self.computation_time = computation_time;
        self
    }

    /// The underlying graph (read-only).
    #[must_use]
    pub fn graph(&self) -> &Graph<PipelineNode> {
        &self.graph
    }

    /// Run metadata attached at restore time, if any.
    #[must_use]
    pub fn computation_time(&self) -> Option<Duration> {
        self.computation_time
    }

    /// Canonical structural fingerprint; equal for structurally equal
    /// pipelines regardless of node identities or fitted state.
    #[must_use]
    pub fn descriptive_id(&self) -> String {
        self.graph.descriptive_id()
    }

    /// Node count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    /// Whether the pipeline has no nodes. Always false for a validated
    /// pipeline; kept for API symmetry with [`Pipeline::len`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Longest root-to-leaf distance, in edges.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.graph.depth()
    }

    /// Whether every node carries a fitted artifact.
    #[must_use]
    pub fn is_fitted(&self) -> bool {
        self.graph.iter().all(|node| node.payload().fitted().is_some())
    }

    /// Fit every operation in topological order, consulting the cache with
    /// each node's subtree fingerprint first. Returns a new fitted pipeline;
    /// `self` is untouched.
    ///
    /// A cache miss invokes `fitter` and publishes the artifact with
    /// first-writer-wins semantics, so a concurrent evaluator finishing the
    /// same fit first costs only the duplicated work.
    ///
    /// # Errors
    ///
    /// [`Error::Evaluation`] when the fitter fails for any node.
    pub fn fit(
        &self,
        fitter: &dyn OperationFitter,
        cache: Option<&OperationsCache>,
        fold: Option<u32>,
    ) -> Result<Pipeline> {
        let order = self.graph.topological_order()?;
        let mut fitted_graph = self.graph.clone();
        for id in order {
            let fingerprint = self.graph.node_descriptive_id(id)?;
            let key = CacheKey::for_descriptive_id(&fingerprint, fold);
            let content = match self.graph.node(id) {
                Some(node) => node.payload().content().clone(),
                None => continue,
            };
            let artifact = match cache.and_then(|cache| cache.get(&key)) {
                Some(artifact) => {
                    debug!(operation = %content.name, ?fold, "pipeline.fit reused cached artifact");
                    artifact
                }
                None => {
                    let computed = fitter.fit(&content, fold).map_err(|err| {
                        Error::evaluation(format!("fitting '{}' failed: {err}", content.name))
                    })?;
                    match cache {
                        Some(cache) => cache.put(key, computed),
                        None => Arc::new(computed),
                    }
                }
            };
            if let Some(node) = fitted_graph.node_mut(id) {
                node.set_fitted(artifact);
            }
        }
        Ok(Self {
            graph: fitted_graph,
            computation_time: self.computation_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn linear_pipeline() -> Pipeline {
        let scaling = GraphNode::new(PipelineNode::primary(NodeContent::new("scaling")));
        let rf = GraphNode::with_parents(
            PipelineNode::secondary(NodeContent::new("rf")),
            [scaling.uid()],
        );
        Pipeline::from_nodes(vec![scaling, rf]).unwrap()
    }

    fn counting_fitter(counter: Arc<AtomicUsize>) -> impl OperationFitter {
        move |operation: &NodeContent, _fold: Option<u32>| -> Result<FittedOperation> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(FittedOperation::new(operation.name.clone(), vec![1, 2, 3]))
        }
    }

    #[test]
    fn test_new_rejects_multiple_roots() {
        let a = GraphNode::new(PipelineNode::primary(NodeContent::new("a")));
        let b = GraphNode::new(PipelineNode::primary(NodeContent::new("b")));
        let result = Pipeline::from_nodes(vec![a, b]);
        assert!(matches!(result, Err(Error::Structure { .. })));
    }

    #[test]
    fn test_new_rejects_role_mismatch() {
        // A secondary-tagged node with no parents is invalid.
        let lonely = GraphNode::new(PipelineNode::secondary(NodeContent::new("rf")));
        let result = Pipeline::from_nodes(vec![lonely]);
        assert!(matches!(result, Err(Error::Structure { .. })));

        // A primary-tagged node with parents is invalid too.
        let a = GraphNode::new(PipelineNode::primary(NodeContent::new("a")));
        let bad = GraphNode::with_parents(PipelineNode::primary(NodeContent::new("b")), [a.uid()]);
        let result = Pipeline::from_nodes(vec![a, bad]);
        assert!(matches!(result, Err(Error::Structure { .. })));
    }

    #[test]
    fn test_fit_invokes_fitter_once_per_node() {
        let pipeline = linear_pipeline();
        let calls = Arc::new(AtomicUsize::new(0));
        let fitter = counting_fitter(calls.clone());

        let fitted = pipeline.fit(&fitter, None, None).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(fitted.is_fitted());
        assert!(!pipeline.is_fitted());
    }

    #[test]
    fn test_fit_skips_work_already_in_cache() {
        let pipeline = linear_pipeline();
        let cache = OperationsCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fitter = counting_fitter(calls.clone());

        pipeline.fit(&fitter, Some(&cache), Some(0)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // A structurally identical pipeline (fresh node ids) hits the cache.
        let twin = Pipeline::new(pipeline.graph().copy()).unwrap();
        let fitted = twin.fit(&fitter, Some(&cache), Some(0)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(fitted.is_fitted());
    }

    #[test]
    fn test_fit_caches_per_fold() {
        let pipeline = linear_pipeline();
        let cache = OperationsCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fitter = counting_fitter(calls.clone());

        pipeline.fit(&fitter, Some(&cache), Some(0)).unwrap();
        pipeline.fit(&fitter, Some(&cache), Some(1)).unwrap();

        // Each fold gets its own artifacts.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_fit_failure_becomes_evaluation_error() {
        let pipeline = linear_pipeline();
        let fitter = |operation: &NodeContent, _fold: Option<u32>| -> Result<FittedOperation> {
            if operation.name == "rf" {
                Err(Error::evaluation("singular matrix"))
            } else {
                Ok(FittedOperation::new(operation.name.clone(), vec![]))
            }
        };

        let result = pipeline.fit(&fitter, None, None);
        match result {
            Err(Error::Evaluation { message }) => {
                assert!(message.contains("'rf'"));
            }
            other => panic!("expected evaluation error, got {other:?}"),
        }
    }

    #[test]
    fn test_shared_subgraph_fits_once_within_one_population() {
        // Two pipelines share the 'scaling' primary subtree; with a shared
        // cache the common node is fitted once.
        let cache = OperationsCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fitter = counting_fitter(calls.clone());

        let first = linear_pipeline();
        let scaling = GraphNode::new(PipelineNode::primary(NodeContent::new("scaling")));
        let logit = GraphNode::with_parents(
            PipelineNode::secondary(NodeContent::new("logit")),
            [scaling.uid()],
        );
        let second = Pipeline::from_nodes(vec![scaling, logit]).unwrap();

        first.fit(&fitter, Some(&cache), None).unwrap();
        second.fit(&fitter, Some(&cache), None).unwrap();

        // scaling, rf, logit - the shared scaling subtree is reused.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_fitted_artifact_shared_by_reference() {
        let pipeline = linear_pipeline();
        let cache = OperationsCache::new();
        let fitter = counting_fitter(Arc::new(AtomicUsize::new(0)));

        let fitted = pipeline.fit(&fitter, Some(&cache), None).unwrap();
        let root = fitted.graph().root_node().unwrap();
        let root_fingerprint = fitted
            .graph()
            .node_descriptive_id(root.uid())
            .unwrap();
        let key = CacheKey::for_descriptive_id(&root_fingerprint, None);
        let cached = cache.get(&key).unwrap();
        assert!(Arc::ptr_eq(root.payload().fitted().unwrap(), &cached));
    }

    #[test]
    fn test_descriptive_id_ignores_fitted_state() {
        let pipeline = linear_pipeline();
        let fitter = counting_fitter(Arc::new(AtomicUsize::new(0)));
        let fitted = pipeline.fit(&fitter, None, None).unwrap();
        assert_eq!(pipeline.descriptive_id(), fitted.descriptive_id());
    }

    #[test]
    fn test_is_empty_is_false_for_validated_pipeline() {
        assert!(!linear_pipeline().is_empty());
    }
}
