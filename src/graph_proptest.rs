// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Property-based tests for graph invariants
//!
//! This module contains proptest-based tests that verify the structural
//! guarantees the search loop relies on under arbitrary mutation sequences.
//!
//! # Tested Invariants
//!
//! 1. **Acyclicity**: no sequence of structural operators produces a path
//!    from a node back to itself
//! 2. **Referential Integrity**: parent lists never dangle after mutation
//! 3. **Atomicity**: a failed operator leaves the fingerprint unchanged
//! 4. **Fingerprint Stability**: copying and record round-trips preserve
//!    the descriptive id
//!
//! # Usage
//!
//! Run these tests with:
//! ```bash
//! cargo test graph_proptest
//! ```
//!
//! For more iterations (to find rarer edge cases):
//! ```bash
//! PROPTEST_CASES=10000 cargo test graph_proptest
//! ```

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::adapter::{PipelineAdapter, RunMetadata};
    use crate::graph::{Graph, OptGraph};
    use crate::node::{NodeContent, NodeId, OptNode};

    // =========================================================================
    // Strategy Helpers
    // =========================================================================

    /// Arbitrary DAG of up to 7 nodes: node `i` picks its parents from the
    /// nodes built before it, so the result is acyclic by construction.
    fn arb_dag() -> impl Strategy<Value = OptGraph> {
        prop::collection::vec(any::<u8>(), 1..8).prop_map(|masks| {
            let mut nodes: Vec<OptNode> = Vec::new();
            for (i, mask) in masks.iter().enumerate() {
                let parents: Vec<NodeId> = nodes
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| (mask >> j) & 1 == 1)
                    .map(|(_, node)| node.uid())
                    .collect();
                let content = NodeContent::new(format!("op{i}"));
                nodes.push(if parents.is_empty() {
                    OptNode::new(content)
                } else {
                    OptNode::with_parents(content, parents)
                });
            }
            Graph::from_nodes(nodes).expect("mask construction is acyclic")
        })
    }

    /// As [`arb_dag`], collapsed to a single root so it is pipeline-shaped.
    fn arb_single_root_dag() -> impl Strategy<Value = OptGraph> {
        arb_dag().prop_map(|mut graph| {
            let roots = graph.root_nodes();
            if roots.len() > 1 {
                let head = OptNode::with_parents(NodeContent::new("head"), roots);
                graph.add_node(head).expect("all roots are present");
            }
            graph
        })
    }

    /// One structural operator application, encoded as (opcode, x, y).
    type EditOp = (u8, u8, u8);

    fn arb_edits() -> impl Strategy<Value = Vec<EditOp>> {
        prop::collection::vec((0u8..5, any::<u8>(), any::<u8>()), 0..24)
    }

    // =========================================================================
    // Properties
    // =========================================================================

    proptest! {
        #[test]
        fn mutation_sequences_preserve_dag_invariants(
            graph in arb_dag(),
            edits in arb_edits(),
        ) {
            let mut graph = graph;
            for (op, x, y) in edits {
                let ids: Vec<NodeId> = graph.iter().map(|node| node.uid()).collect();
                prop_assert!(!ids.is_empty());
                let a = ids[x as usize % ids.len()];
                let b = ids[y as usize % ids.len()];
                let before = graph.descriptive_id();

                let result = match op {
                    0 => graph.connect_nodes(a, b),
                    1 => graph.disconnect_nodes(a, b, x % 2 == 0),
                    2 => graph.delete_node(a),
                    3 => graph.add_node(OptNode::with_parents(
                        NodeContent::new(format!("fresh{x}")),
                        [b],
                    )),
                    _ => graph
                        .update_node(a, OptNode::new(NodeContent::new(format!("swap{y}"))))
                        .map(|_| ()),
                };

                // A rejected mutation must leave the graph untouched.
                if result.is_err() {
                    prop_assert_eq!(graph.descriptive_id(), before);
                }

                // Acyclicity and referential integrity hold either way.
                prop_assert!(graph.topological_order().is_ok());
                for node in graph.iter() {
                    for parent in node.nodes_from() {
                        prop_assert!(graph.contains(parent));
                    }
                }
            }
        }

        #[test]
        fn copy_preserves_fingerprint_with_fresh_identities(graph in arb_dag()) {
            let copied = graph.copy();
            prop_assert_eq!(copied.descriptive_id(), graph.descriptive_id());
            for node in copied.iter() {
                prop_assert!(!graph.contains(node.uid()));
            }
        }

        #[test]
        fn record_round_trip_preserves_structure(graph in arb_dag()) {
            let rebuilt = OptGraph::from_records(graph.to_records())
                .expect("a valid graph's records round-trip");
            prop_assert_eq!(rebuilt.len(), graph.len());
            prop_assert_eq!(rebuilt.descriptive_id(), graph.descriptive_id());
        }

        #[test]
        fn adapter_round_trip_is_lossless(graph in arb_single_root_dag()) {
            let adapter = PipelineAdapter::new();
            let pipeline = adapter
                .restore(&graph, RunMetadata::new())
                .expect("single-root graphs restore");
            let adapted = adapter.adapt(&pipeline).expect("valid pipelines adapt");
            prop_assert_eq!(adapted.descriptive_id(), graph.descriptive_id());
        }
    }
}
