//! Upward queries: ancestry, depth, common ancestors, distances.

use std::ops::Range;

use generational_arena::Index;
use serde_json::Value;
use tracing::instrument;

use crate::domain::arena::LoomTree;
use crate::domain::error::{DomainError, TreeResult};

impl LoomTree {
    /// Root-to-node path, inclusive on both ends.
    ///
    /// Walks parent handles; a parent that does not resolve or a walk longer
    /// than the tree is a structural inconsistency.
    #[instrument(level = "trace", skip(self))]
    pub fn ancestry(&self, idx: Index) -> TreeResult<Vec<Index>> {
        let mut lineage = vec![idx];
        let mut current = self.node(idx)?;
        while let Some(parent_idx) = current.parent {
            if lineage.len() > self.len() {
                return Err(DomainError::StructuralInconsistency(format!(
                    "cycle in ancestry of {}",
                    self.node(idx)?.id
                )));
            }
            current = self.get_node(parent_idx).ok_or_else(|| {
                DomainError::StructuralInconsistency(format!("parent of {} missing", current.id))
            })?;
            lineage.push(parent_idx);
        }
        lineage.reverse();
        Ok(lineage)
    }

    /// 0 for the root, else 1 + depth of the parent.
    pub fn depth(&self, idx: Index) -> TreeResult<usize> {
        Ok(self.ancestry(idx)?.len() - 1)
    }

    /// Ancestry of `idx` starting at `root` instead of the tree root.
    pub fn ancestry_in_range(&self, root: Index, idx: Index) -> TreeResult<Vec<Index>> {
        let lineage = self.ancestry(idx)?;
        let start = lineage.iter().position(|&i| i == root).ok_or_else(|| {
            DomainError::NotFound(format!("{:?} is not an ancestor of {:?}", root, idx))
        })?;
        Ok(lineage[start..].to_vec())
    }

    /// Deepest node shared by both ancestries, and its depth.
    #[instrument(level = "debug", skip(self))]
    pub fn nearest_common_ancestor(&self, a: Index, b: Index) -> TreeResult<(Index, usize)> {
        let ancestry_a = self.ancestry(a)?;
        let ancestry_b = self.ancestry(b)?;
        if ancestry_a[0] != ancestry_b[0] {
            return Err(DomainError::StructuralInconsistency(format!(
                "{} and {} do not share a root",
                self.node(a)?.id,
                self.node(b)?.id
            )));
        }
        let shared = ancestry_a
            .iter()
            .zip(&ancestry_b)
            .take_while(|(x, y)| x == y)
            .count();
        Ok((ancestry_a[shared - 1], shared - 1))
    }

    /// Number of edges on the path between `a` and `b`.
    pub fn path_distance(&self, a: Index, b: Index) -> TreeResult<usize> {
        let (_, nca_depth) = self.nearest_common_ancestor(a, b)?;
        Ok((self.depth(a)? - nca_depth) + (self.depth(b)? - nca_depth))
    }

    /// True if `candidate` lies on the root-to-`idx` path (inclusive).
    pub fn in_ancestry(&self, candidate: Index, idx: Index) -> TreeResult<bool> {
        Ok(self.ancestry(idx)?.contains(&candidate))
    }

    /// Value of `attribute` on the nearest node, starting at `idx` and walking up.
    pub fn inherited_attribute(&self, attribute: &str, idx: Index) -> TreeResult<Option<Value>> {
        for lineage_idx in self.ancestry(idx)?.into_iter().rev() {
            if let Some(value) = self.node(lineage_idx)?.attribute(attribute) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Whether `a` was created no later than `b`.
    pub fn created_before(&self, a: Index, b: Index) -> TreeResult<bool> {
        let node_a = self.node(a)?;
        let node_b = self.node(b)?;
        let t1 = node_a.meta.parsed_timestamp(&node_a.id)?;
        let t2 = node_b.meta.parsed_timestamp(&node_b.id)?;
        Ok(t1 <= t2)
    }

    /// Concatenated text of an ancestry, i.e. the document up to its last node.
    pub fn ancestry_plaintext(&self, ancestry: &[Index]) -> TreeResult<String> {
        let mut text = String::new();
        for &idx in ancestry {
            text.push_str(&self.node(idx)?.text);
        }
        Ok(text)
    }

    /// Byte range each ancestry node occupies in `ancestry_plaintext`.
    pub fn ancestor_text_indices(&self, ancestry: &[Index]) -> TreeResult<Vec<Range<usize>>> {
        let mut start = 0;
        let mut ranges = Vec::with_capacity(ancestry.len());
        for &idx in ancestry {
            let len = self.node(idx)?.text.len();
            ranges.push(start..start + len);
            start += len;
        }
        Ok(ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::NodeMeta;

    #[test]
    fn given_removed_node_when_nca_then_not_found() {
        let mut tree = LoomTree::new();
        let root = tree.insert_node("R", None).unwrap();
        let a = tree.insert_node("A", Some(root)).unwrap();
        tree.remove_subtree(a).unwrap();
        assert!(matches!(
            tree.nearest_common_ancestor(root, a),
            Err(DomainError::NotFound(_))
        ));
    }

    #[test]
    fn given_missing_timestamp_when_comparing_then_reports_error() {
        let mut tree = LoomTree::new();
        let root = tree.insert_node("R", None).unwrap();
        let a = tree.insert_node("A", Some(root)).unwrap();
        tree.get_node_mut(a).unwrap().meta = NodeMeta {
            creation_timestamp: Some("2023-01-02-03.04.05".into()),
        };
        assert!(matches!(
            tree.created_before(root, a),
            Err(DomainError::MissingTimestamp(_))
        ));
    }

    #[test]
    fn given_ancestry_when_computing_text_indices_then_ranges_are_contiguous() {
        let mut tree = LoomTree::new();
        let root = tree.insert_node("Once", None).unwrap();
        let a = tree.insert_node(" upon", Some(root)).unwrap();
        let b = tree.insert_node(" a time", Some(a)).unwrap();
        let ancestry = tree.ancestry(b).unwrap();
        assert_eq!(tree.ancestry_plaintext(&ancestry).unwrap(), "Once upon a time");
        assert_eq!(
            tree.ancestor_text_indices(&ancestry).unwrap(),
            vec![0..4, 4..9, 9..16]
        );
    }
}
