// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # DashEvolve - Evolutionary Pipeline-Graph Engine
//!
//! DashEvolve is the graph core of an automated machine-learning search:
//! candidate pipelines are DAGs of operations, and an external evolutionary
//! loop mutates, crosses, and evaluates them generation after generation.
//! This crate owns the parts that make that loop safe and fast:
//!
//! - **Graph / nodes** ([`graph`], [`node`]) - the DAG representation with
//!   mutation operators that keep acyclicity and referential integrity
//!   through arbitrary edit sequences, plus the canonical `descriptive_id`
//!   structural fingerprint.
//! - **Adapter** ([`adapter`]) - lossless translation between the domain
//!   [`Pipeline`] (role-tagged nodes, fitted state) and the optimizer-side
//!   [`OptGraph`] (structural content only), with no aliasing between the
//!   two representations.
//! - **Node factory** ([`factory`]) - role-safe node proposals for mutation
//!   operators, driven by an injected seedable RNG.
//! - **Operations cache** ([`cache`]) - a concurrent fingerprint+fold →
//!   fitted-artifact store with LRU byte-budget eviction and
//!   corruption-tolerant persistence, so overlapping subgraphs across a
//!   population are fitted at most once per fold.
//! - **Evaluation** ([`eval`]) - bounded-parallel restore → fit-with-cache
//!   → score over one generation, with per-candidate failure containment.
//!
//! ## Example
//!
//! ```rust
//! use dashevolve::{
//!     ComposerRequirements, DefaultNodeFactory, Graph, NodeFactory, OptNode, PipelineAdapter,
//!     RunMetadata,
//! };
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! # fn main() -> dashevolve::Result<()> {
//! // Search space: which operations may appear where.
//! let factory = DefaultNodeFactory::new(ComposerRequirements::new(
//!     ["scaling", "pca"],
//!     ["rf", "logit"],
//! ));
//! let mut rng = StdRng::seed_from_u64(42);
//!
//! // Seed a candidate: one primary feeding one secondary.
//! let leaf = factory.get_node(true, &mut rng)?;
//! let root = factory.get_secondary_node(&[leaf.uid()], &mut rng)?;
//! let mut graph = Graph::from_nodes(vec![leaf, root])?;
//!
//! // Mutate it: swap the root for another role-compatible operation.
//! let root_id = graph.root_node()?.uid();
//! let replacement = factory.exchange_node(graph.node(root_id).unwrap(), &mut rng)?;
//! graph.update_node(root_id, replacement)?;
//!
//! // Hand it to the domain side for fitting.
//! let pipeline = PipelineAdapter::new().restore(&graph, RunMetadata::new())?;
//! assert_eq!(pipeline.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod cache;
pub mod error;
pub mod eval;
pub mod factory;
pub mod graph;
pub mod node;
pub mod pipeline;

#[cfg(test)]
mod graph_proptest;

pub use adapter::{PipelineAdapter, RunMetadata};
pub use cache::{CacheKey, CacheStats, OperationsCache};
pub use error::{Error, Result};
pub use eval::{CandidateOutcome, EvaluationConfig, PipelineScorer, PopulationEvaluator};
pub use factory::{ComposerRequirements, DefaultNodeFactory, NodeFactory};
pub use graph::{Graph, NodeRecord, OptGraph};
pub use node::{GraphNode, NodeContent, NodeId, NodePayload, OptNode, ParentList};
pub use pipeline::{FittedOperation, OperationFitter, Pipeline, PipelineNode};
