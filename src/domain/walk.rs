//! Weighted random descent.

use std::fmt;
use std::str::FromStr;

use generational_arena::Index;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::{debug, instrument};

use crate::domain::arena::LoomTree;
use crate::domain::error::{DomainError, TreeResult};
use crate::domain::view::NodeFilter;

/// How a child's transition weight is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionMode {
    /// Number of filtered descendants of the child (the child included)
    #[default]
    Descendants,
    /// Number of leaves among those descendants
    Leaves,
    /// Constant 1 per eligible child
    Uniform,
}

impl fmt::Display for TransitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionMode::Descendants => "descendants",
            TransitionMode::Leaves => "leaves",
            TransitionMode::Uniform => "uniform",
        };
        f.write_str(name)
    }
}

impl FromStr for TransitionMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "descendants" | "descendents" => Ok(TransitionMode::Descendants),
            "leaves" => Ok(TransitionMode::Leaves),
            "uniform" => Ok(TransitionMode::Uniform),
            other => Err(DomainError::PreconditionViolated(format!(
                "unknown transition mode '{other}'"
            ))),
        }
    }
}

impl LoomTree {
    /// L1-normalized transition weights over all children of `idx`.
    ///
    /// Children rejected by `filter` get weight 0. A zero norm is rejected
    /// instead of producing NaN weights.
    #[instrument(level = "debug", skip(self, filter))]
    pub fn subtree_weights(
        &self,
        idx: Index,
        mode: TransitionMode,
        filter: Option<NodeFilter<'_>>,
    ) -> TreeResult<Vec<f64>> {
        let node = self.node(idx)?;
        let mut weights = Vec::with_capacity(node.children.len());
        for &child in &node.children {
            let child_node = self.node(child)?;
            if !filter.map_or(true, |f| f(child_node)) {
                weights.push(0.0);
                continue;
            }
            let weight = match mode {
                TransitionMode::Descendants => self.num_descendants(child, filter)?,
                TransitionMode::Leaves => {
                    let mut leaves = 0;
                    for descendant in self.subtree_list(child, filter, None)? {
                        if self.node(descendant)?.is_leaf() {
                            leaves += 1;
                        }
                    }
                    leaves
                }
                TransitionMode::Uniform => 1,
            };
            weights.push(weight as f64);
        }

        let norm: f64 = weights.iter().sum();
        if norm <= 0.0 {
            return Err(DomainError::InvalidWeights(format!(
                "all {} weights of {} are zero (mode {mode})",
                weights.len(),
                node.id
            )));
        }
        Ok(weights.into_iter().map(|w| w / norm).collect())
    }

    /// Pick one child of `idx` at random, proportional to its weight.
    pub fn stochastic_transition<R: Rng + ?Sized>(
        &self,
        idx: Index,
        mode: TransitionMode,
        filter: Option<NodeFilter<'_>>,
        rng: &mut R,
    ) -> TreeResult<Index> {
        let node = self.node(idx)?;
        if node.children.is_empty() {
            return Err(DomainError::PreconditionViolated(format!(
                "{} has no children to transition to",
                node.id
            )));
        }
        let weights = self.subtree_weights(idx, mode, filter)?;
        let distribution =
            WeightedIndex::new(&weights).map_err(|e| DomainError::InvalidWeights(e.to_string()))?;
        let choice = node.children[distribution.sample(rng)];
        debug!("transition {} -> {:?}", node.id, choice);
        Ok(choice)
    }

    /// Repeated transitions from `idx` until a leaf is reached or `max_steps` run out.
    pub fn random_walk<R: Rng + ?Sized>(
        &self,
        idx: Index,
        mode: TransitionMode,
        filter: Option<NodeFilter<'_>>,
        max_steps: usize,
        rng: &mut R,
    ) -> TreeResult<Vec<Index>> {
        let mut path = vec![idx];
        let mut current = idx;
        for _ in 0..max_steps {
            if self.node(current)?.is_leaf() {
                break;
            }
            current = self.stochastic_transition(current, mode, filter, rng)?;
            path.push(current);
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::Node;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn given_leaf_when_transitioning_then_precondition_violated() {
        let mut tree = LoomTree::new();
        let root = tree.insert_node("R", None).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let result = tree.stochastic_transition(root, TransitionMode::Uniform, None, &mut rng);
        assert!(matches!(result, Err(DomainError::PreconditionViolated(_))));
    }

    #[test]
    fn given_all_children_filtered_when_weighting_then_invalid_weights() {
        let mut tree = LoomTree::new();
        let root = tree.insert_node("R", None).unwrap();
        tree.insert_node("A", Some(root)).unwrap();
        tree.insert_node("B", Some(root)).unwrap();
        let none = |_: &Node| false;
        let result = tree.subtree_weights(root, TransitionMode::Descendants, Some(&none));
        assert!(matches!(result, Err(DomainError::InvalidWeights(_))));
    }

    #[test]
    fn given_unknown_mode_when_parsing_then_errors() {
        assert!("sideways".parse::<TransitionMode>().is_err());
        assert_eq!("leaves".parse::<TransitionMode>().unwrap(), TransitionMode::Leaves);
    }
}
