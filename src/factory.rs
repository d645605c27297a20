// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Node factory: role-constrained node proposals for mutation
//!
//! Mutation operators grow and rewrite graphs through a [`NodeFactory`],
//! which draws operation names from the composer's configured pools:
//! *primary* operations (legal without parents, consume raw input) and
//! *secondary* operations (require at least one parent). The factory
//! guarantees role safety - swapping a node never produces an operation
//! that is illegal in the node's current position.
//!
//! Randomness is injected: every entry point takes a caller-supplied
//! [`RngCore`], so a fixed seed reproduces an identical sequence of
//! proposals across runs and tests.

use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::{GraphNode, NodeContent, NodeId, OptNode};

/// Composer configuration: which operation names are legal as primary and
/// secondary nodes. The two sets may overlap or be disjoint; an operation
/// listed in both is legal in either position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposerRequirements {
    /// Operations legal without parents.
    pub primary: Vec<String>,
    /// Operations requiring at least one parent.
    pub secondary: Vec<String>,
}

impl ComposerRequirements {
    /// Requirements from the two operation pools.
    #[must_use]
    pub fn new(
        primary: impl IntoIterator<Item = impl Into<String>>,
        secondary: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            primary: primary.into_iter().map(Into::into).collect(),
            secondary: secondary.into_iter().map(Into::into).collect(),
        }
    }

    /// The pool for the requested role.
    #[must_use]
    pub fn operations(&self, is_primary: bool) -> &[String] {
        if is_primary {
            &self.primary
        } else {
            &self.secondary
        }
    }
}

/// Proposes structurally valid nodes during mutation. Implementations may
/// plug in their own selection policy; [`DefaultNodeFactory`] draws
/// uniformly at random.
pub trait NodeFactory {
    /// Fresh node with no parents, drawn from the requested role pool. When
    /// building a secondary node this way the caller is responsible for
    /// attaching parents (or use [`NodeFactory::get_secondary_node`]).
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when the requested pool is empty.
    fn get_node(&self, is_primary: bool, rng: &mut dyn RngCore) -> Result<OptNode>;

    /// Fresh secondary node already wired to the given parents.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when the secondary pool is empty or no
    /// parents were supplied.
    fn get_secondary_node(
        &self,
        parents: &[NodeId],
        rng: &mut dyn RngCore,
    ) -> Result<OptNode>;

    /// Replacement for `node` drawn from the pool matching its current role
    /// (inferred from parent presence), keeping its parent list. Swapping
    /// the returned node in therefore preserves graph validity.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when the role-matching pool is empty.
    fn exchange_node(&self, node: &OptNode, rng: &mut dyn RngCore) -> Result<OptNode>;

    /// New node suitable as an additional parent of `child`, drawn from the
    /// requested role pool; used by graph-growing mutations.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when the requested pool is empty.
    fn get_parent_node(
        &self,
        child: &OptNode,
        is_primary: bool,
        rng: &mut dyn RngCore,
    ) -> Result<OptNode>;
}

/// Uniform-random node factory over a [`ComposerRequirements`] search space.
#[derive(Debug, Clone)]
pub struct DefaultNodeFactory {
    requirements: ComposerRequirements,
}

impl DefaultNodeFactory {
    /// Factory over the given search space.
    #[must_use]
    pub fn new(requirements: ComposerRequirements) -> Self {
        Self { requirements }
    }

    /// The configured search space.
    #[must_use]
    pub fn requirements(&self) -> &ComposerRequirements {
        &self.requirements
    }

    fn draw(&self, is_primary: bool, rng: &mut dyn RngCore) -> Result<NodeContent> {
        let pool = self.requirements.operations(is_primary);
        let role = if is_primary { "primary" } else { "secondary" };
        let name = pool.choose(rng).ok_or_else(|| {
            Error::configuration(format!("the {role} operation pool is empty"))
        })?;
        Ok(NodeContent::new(name.clone()))
    }
}

impl NodeFactory for DefaultNodeFactory {
    fn get_node(&self, is_primary: bool, rng: &mut dyn RngCore) -> Result<OptNode> {
        Ok(GraphNode::new(self.draw(is_primary, rng)?))
    }

    fn get_secondary_node(&self, parents: &[NodeId], rng: &mut dyn RngCore) -> Result<OptNode> {
        if parents.is_empty() {
            return Err(Error::configuration(
                "a secondary node requires at least one parent",
            ));
        }
        Ok(GraphNode::with_parents(
            self.draw(false, rng)?,
            parents.iter().copied(),
        ))
    }

    fn exchange_node(&self, node: &OptNode, rng: &mut dyn RngCore) -> Result<OptNode> {
        let is_primary = node.nodes_from().is_empty();
        Ok(GraphNode::with_parents(
            self.draw(is_primary, rng)?,
            node.nodes_from().iter(),
        ))
    }

    fn get_parent_node(
        &self,
        _child: &OptNode,
        is_primary: bool,
        rng: &mut dyn RngCore,
    ) -> Result<OptNode> {
        Ok(GraphNode::new(self.draw(is_primary, rng)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn requirements() -> ComposerRequirements {
        ComposerRequirements::new(
            ["bernb", "rf", "qda", "pca", "normalization"],
            ["dt", "logit", "rf", "scaling"],
        )
    }

    #[test]
    fn test_factory_respects_role_pools() {
        let factory = DefaultNodeFactory::new(requirements());
        let mut rng = StdRng::seed_from_u64(42);

        let primary = OptNode::new(NodeContent::new("pca"));
        let secondary = OptNode::with_parents(NodeContent::new("dt"), [primary.uid()]);

        let changed_primary = factory.exchange_node(&primary, &mut rng).unwrap();
        let changed_secondary = factory.exchange_node(&secondary, &mut rng).unwrap();
        let new_primary = factory.get_node(true, &mut rng).unwrap();
        let new_secondary = factory.get_node(false, &mut rng).unwrap();
        let separate_parent = factory.get_parent_node(&secondary, true, &mut rng).unwrap();
        let intermediate_parent = factory.get_parent_node(&secondary, false, &mut rng).unwrap();

        for node in [&changed_primary, &new_primary, &separate_parent] {
            assert!(factory
                .requirements()
                .operations(true)
                .contains(&node.payload().name));
        }
        for node in [&changed_secondary, &new_secondary, &intermediate_parent] {
            assert!(factory
                .requirements()
                .operations(false)
                .contains(&node.payload().name));
        }
    }

    #[test]
    fn test_exchange_node_keeps_parent_list() {
        let factory = DefaultNodeFactory::new(requirements());
        let mut rng = StdRng::seed_from_u64(7);

        let a = OptNode::new(NodeContent::new("pca"));
        let b = OptNode::new(NodeContent::new("normalization"));
        let secondary = OptNode::with_parents(NodeContent::new("dt"), [a.uid(), b.uid()]);

        let replacement = factory.exchange_node(&secondary, &mut rng).unwrap();
        assert_eq!(replacement.nodes_from(), secondary.nodes_from());
        assert_ne!(replacement.uid(), secondary.uid());
    }

    #[test]
    fn test_get_secondary_node_attaches_parents() {
        let factory = DefaultNodeFactory::new(requirements());
        let mut rng = StdRng::seed_from_u64(7);

        let parent = OptNode::new(NodeContent::new("pca"));
        let node = factory.get_secondary_node(&[parent.uid()], &mut rng).unwrap();
        assert!(!node.is_primary());
        assert!(factory
            .requirements()
            .operations(false)
            .contains(&node.payload().name));

        let result = factory.get_secondary_node(&[], &mut rng);
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_empty_pool_is_a_configuration_error() {
        let factory = DefaultNodeFactory::new(ComposerRequirements::new(
            ["pca"],
            Vec::<String>::new(),
        ));
        let mut rng = StdRng::seed_from_u64(0);

        assert!(factory.get_node(true, &mut rng).is_ok());
        assert!(matches!(
            factory.get_node(false, &mut rng),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_fixed_seed_reproduces_proposal_sequence() {
        let factory = DefaultNodeFactory::new(requirements());

        let draw_sequence = |seed: u64| -> Vec<String> {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..16)
                .map(|round| {
                    factory
                        .get_node(round % 2 == 0, &mut rng)
                        .unwrap()
                        .payload()
                        .name
                        .clone()
                })
                .collect()
        };

        assert_eq!(draw_sequence(1234), draw_sequence(1234));
    }
}
