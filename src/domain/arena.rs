use std::collections::{HashMap, HashSet};

use generational_arena::{Arena, Index};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::domain::error::{DomainError, TreeResult};
use crate::domain::node::{Node, NodeId};

/// Arena-based loom tree.
///
/// Nodes live in a generational arena and reference each other by handle, so
/// the parent pointer and the child list never form an ownership cycle. A
/// separate id index gives O(1) lookup from a `NodeId` to its handle and is kept
/// in sync on every insert and removal.
#[derive(Debug, Clone)]
pub struct LoomTree {
    arena: Arena<Node>,
    root: Option<Index>,
    index: HashMap<NodeId, Index>,
}

impl Default for LoomTree {
    fn default() -> Self {
        Self::new()
    }
}

impl LoomTree {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            root: None,
            index: HashMap::new(),
        }
    }

    /// Insert a node with a freshly generated id.
    pub fn insert_node(
        &mut self,
        text: impl Into<String>,
        parent: Option<Index>,
    ) -> TreeResult<Index> {
        self.insert_with_id(NodeId::generate(), text, parent)
    }

    /// Insert a node with a caller supplied id.
    ///
    /// Fails if the id is taken, if the parent handle is stale, or if a second
    /// root is requested.
    #[instrument(level = "trace", skip(self, text))]
    pub fn insert_with_id(
        &mut self,
        id: NodeId,
        text: impl Into<String>,
        parent: Option<Index>,
    ) -> TreeResult<Index> {
        if self.index.contains_key(&id) {
            return Err(DomainError::PreconditionViolated(format!("duplicate node id {id}")));
        }
        match parent {
            Some(parent_idx) if !self.arena.contains(parent_idx) => {
                return Err(DomainError::NotFound(format!("parent handle {parent_idx:?}")));
            }
            None if self.root.is_some() => {
                return Err(DomainError::PreconditionViolated(
                    "tree already has a root".to_string(),
                ));
            }
            _ => {}
        }

        let node = Node::new(id.clone(), text.into(), parent);
        let node_idx = self.arena.insert(node);
        self.index.insert(id, node_idx);

        if let Some(parent_idx) = parent {
            if let Some(parent) = self.arena.get_mut(parent_idx) {
                parent.children.push(node_idx);
            }
        } else {
            self.root = Some(node_idx);
        }

        Ok(node_idx)
    }

    pub fn get_node(&self, idx: Index) -> Option<&Node> {
        self.arena.get(idx)
    }

    pub fn get_node_mut(&mut self, idx: Index) -> Option<&mut Node> {
        self.arena.get_mut(idx)
    }

    /// Like `get_node`, but a stale handle is an error.
    pub fn node(&self, idx: Index) -> TreeResult<&Node> {
        self.arena
            .get(idx)
            .ok_or_else(|| DomainError::NotFound(format!("node handle {idx:?}")))
    }

    pub(crate) fn node_mut(&mut self, idx: Index) -> TreeResult<&mut Node> {
        self.arena
            .get_mut(idx)
            .ok_or_else(|| DomainError::NotFound(format!("node handle {idx:?}")))
    }

    /// Resolve an id to its arena handle.
    pub fn lookup(&self, id: &NodeId) -> TreeResult<Index> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| DomainError::NotFound(id.to_string()))
    }

    pub fn contains_id(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn root(&self) -> Option<Index> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Pre-order iterator over the whole tree.
    pub fn iter(&self) -> TreeIterator<'_> {
        TreeIterator::new(self, self.root)
    }

    /// Pre-order iterator over the subtree rooted at `idx`.
    pub fn iter_from(&self, idx: Index) -> TreeIterator<'_> {
        TreeIterator::new(self, Some(idx))
    }

    pub fn iter_postorder_from(&self, idx: Index) -> PostOrderIterator<'_> {
        PostOrderIterator::new(self, idx)
    }

    /// Height of the subtree at `idx`: 1 for a leaf, else 1 + tallest child.
    #[instrument(level = "trace", skip(self))]
    pub fn height(&self, idx: Index) -> TreeResult<usize> {
        self.node(idx)?;
        let mut heights: HashMap<Index, usize> = HashMap::new();
        for (node_idx, node) in self.iter_postorder_from(idx) {
            let tallest = node
                .children
                .iter()
                .filter_map(|child| heights.get(child))
                .max()
                .copied()
                .unwrap_or(0);
            heights.insert(node_idx, tallest + 1);
        }
        heights
            .get(&idx)
            .copied()
            .ok_or_else(|| DomainError::StructuralInconsistency(format!("cycle below {idx:?}")))
    }

    /// Collects all leaf nodes (nodes with no children) in the tree.
    pub fn leaf_nodes(&self) -> Vec<Index> {
        self.iter()
            .filter(|(_, node)| node.is_leaf())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Detach and drop `idx` with all of its descendants.
    ///
    /// The nodes are unlinked from the parent's child list and from the id
    /// index. Removing the root empties the tree.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_subtree(&mut self, idx: Index) -> TreeResult<Vec<Node>> {
        let parent = self.node(idx)?.parent;
        let doomed: Vec<Index> = self.iter_from(idx).map(|(i, _)| i).collect();

        if let Some(parent_idx) = parent {
            let parent = self.node_mut(parent_idx)?;
            parent.children.retain(|&child| child != idx);
        } else {
            self.root = None;
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for node_idx in doomed {
            if let Some(node) = self.arena.remove(node_idx) {
                self.index.remove(&node.id);
                removed.push(node);
            }
        }
        debug!("removed {} nodes", removed.len());
        Ok(removed)
    }

    /// Wrap a mutable root under a new empty, immutable, visited root.
    ///
    /// Returns the new root handle, or None when the root already is immutable
    /// or the tree is empty.
    pub fn add_immutable_root(&mut self) -> TreeResult<Option<Index>> {
        let Some(old_root) = self.root else {
            return Ok(None);
        };
        if !self.node(old_root)?.mutable {
            return Ok(None);
        }

        let id = NodeId::generate();
        let mut new_root = Node::new(id.clone(), String::new(), None);
        new_root.mutable = false;
        new_root.attributes.insert("visited".to_string(), Value::Bool(true));
        new_root.children.push(old_root);

        let new_idx = self.arena.insert(new_root);
        self.index.insert(id, new_idx);
        self.node_mut(old_root)?.parent = Some(new_idx);
        self.root = Some(new_idx);
        Ok(Some(new_idx))
    }

    /// Check every structural invariant of the tree.
    #[instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> TreeResult<()> {
        if self.arena.is_empty() {
            return Ok(());
        }
        let root = self
            .root
            .ok_or_else(|| {
                DomainError::StructuralInconsistency("non-empty tree without root".into())
            })?;
        if self.node(root)?.parent.is_some() {
            return Err(DomainError::StructuralInconsistency("root has a parent".into()));
        }
        if self.index.len() != self.arena.len() {
            return Err(DomainError::StructuralInconsistency(format!(
                "index holds {} ids for {} nodes",
                self.index.len(),
                self.arena.len()
            )));
        }

        for (idx, node) in self.arena.iter() {
            if self.index.get(&node.id) != Some(&idx) {
                return Err(DomainError::StructuralInconsistency(format!(
                    "index out of sync for {}",
                    node.id
                )));
            }
            if let Some(parent_idx) = node.parent {
                let parent = self.arena.get(parent_idx).ok_or_else(|| {
                    DomainError::StructuralInconsistency(format!("parent of {} missing", node.id))
                })?;
                let memberships = parent.children.iter().filter(|&&c| c == idx).count();
                if memberships != 1 {
                    return Err(DomainError::StructuralInconsistency(format!(
                        "{} listed {} times by its parent {}",
                        node.id, memberships, parent.id
                    )));
                }
            } else if idx != root {
                return Err(DomainError::StructuralInconsistency(format!(
                    "second root {}",
                    node.id
                )));
            }
            for &child in &node.children {
                let child_node = self.arena.get(child).ok_or_else(|| {
                    DomainError::StructuralInconsistency(format!("dangling child of {}", node.id))
                })?;
                if child_node.parent != Some(idx) {
                    return Err(DomainError::StructuralInconsistency(format!(
                        "{} lists {} whose parent differs",
                        node.id, child_node.id
                    )));
                }
            }
        }

        // Every node must be reachable from the root exactly once.
        let mut seen = HashSet::new();
        for (idx, node) in self.iter() {
            if !seen.insert(idx) {
                return Err(DomainError::StructuralInconsistency(format!(
                    "cycle through {}",
                    node.id
                )));
            }
        }
        if seen.len() != self.arena.len() {
            return Err(DomainError::StructuralInconsistency(format!(
                "{} nodes unreachable from root",
                self.arena.len() - seen.len()
            )));
        }
        Ok(())
    }
}

pub struct TreeIterator<'a> {
    tree: &'a LoomTree,
    stack: Vec<Index>,
    budget: usize,
}

impl<'a> TreeIterator<'a> {
    fn new(tree: &'a LoomTree, start: Option<Index>) -> Self {
        Self {
            tree,
            stack: start.into_iter().collect(),
            budget: tree.len(),
        }
    }
}

impl<'a> Iterator for TreeIterator<'a> {
    type Item = (Index, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(current_idx) = self.stack.pop() {
            if let Some(node) = self.tree.get_node(current_idx) {
                // a cyclic link would otherwise loop forever
                if self.budget == 0 {
                    return None;
                }
                self.budget -= 1;
                // Push children in reverse order for left-to-right traversal
                for &child in node.children.iter().rev() {
                    self.stack.push(child);
                }
                return Some((current_idx, node));
            }
        }
        None
    }
}

pub struct PostOrderIterator<'a> {
    tree: &'a LoomTree,
    stack: Vec<(Index, bool)>,
    budget: usize,
}

impl<'a> PostOrderIterator<'a> {
    fn new(tree: &'a LoomTree, start: Index) -> Self {
        Self {
            tree,
            stack: vec![(start, false)],
            budget: tree.len(),
        }
    }
}

impl<'a> Iterator for PostOrderIterator<'a> {
    type Item = (Index, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((current_idx, visited)) = self.stack.pop() {
            if let Some(node) = self.tree.get_node(current_idx) {
                if !visited {
                    if self.budget == 0 {
                        return None;
                    }
                    self.budget -= 1;
                    self.stack.push((current_idx, true));
                    for &child in node.children.iter().rev() {
                        self.stack.push((child, false));
                    }
                } else {
                    return Some((current_idx, node));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (LoomTree, Index, Index, Index) {
        let mut tree = LoomTree::new();
        let root = tree.insert_node("R", None).unwrap();
        let a = tree.insert_node("A", Some(root)).unwrap();
        let b = tree.insert_node("B", Some(root)).unwrap();
        tree.insert_node("C", Some(a)).unwrap();
        (tree, root, a, b)
    }

    #[test]
    fn given_second_root_when_inserting_then_rejects() {
        let (mut tree, ..) = sample();
        let result = tree.insert_node("other", None);
        assert!(matches!(result, Err(DomainError::PreconditionViolated(_))));
    }

    #[test]
    fn given_duplicate_id_when_inserting_then_rejects() {
        let mut tree = LoomTree::new();
        let root = tree.insert_with_id("r".into(), "R", None).unwrap();
        let result = tree.insert_with_id("r".into(), "again", Some(root));
        assert!(matches!(result, Err(DomainError::PreconditionViolated(_))));
    }

    #[test]
    fn given_tree_when_iterating_then_pre_order_left_to_right() {
        let (tree, ..) = sample();
        let texts: Vec<&str> = tree.iter().map(|(_, n)| n.text.as_str()).collect();
        assert_eq!(texts, vec!["R", "A", "C", "B"]);
    }

    #[test]
    fn given_tree_when_iterating_postorder_then_children_first() {
        let (tree, root, ..) = sample();
        let texts: Vec<&str> = tree
            .iter_postorder_from(root)
            .map(|(_, n)| n.text.as_str())
            .collect();
        assert_eq!(texts, vec!["C", "A", "B", "R"]);
    }

    #[test]
    fn given_tree_when_computing_height_then_counts_levels() {
        let (tree, root, a, b) = sample();
        assert_eq!(tree.height(root).unwrap(), 3);
        assert_eq!(tree.height(a).unwrap(), 2);
        assert_eq!(tree.height(b).unwrap(), 1);
    }

    #[test]
    fn given_subtree_when_removing_then_index_and_parent_updated() {
        let (mut tree, root, a, _) = sample();
        let removed = tree.remove_subtree(a).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.node(root).unwrap().children().len(), 1);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn given_mutable_root_when_adding_immutable_root_then_wraps_it() {
        let (mut tree, old_root, ..) = sample();
        let new_root = tree.add_immutable_root().unwrap().unwrap();
        assert_eq!(tree.root(), Some(new_root));
        assert!(!tree.node(new_root).unwrap().mutable);
        assert_eq!(tree.node(old_root).unwrap().parent(), Some(new_root));
        assert!(tree.validate().is_ok());
        assert_eq!(tree.add_immutable_root().unwrap(), None);
    }

    #[test]
    fn given_corrupted_child_list_when_validating_then_structural_inconsistency() {
        let (mut tree, root, a, _) = sample();
        tree.get_node_mut(root).unwrap().children.push(a);
        assert!(matches!(
            tree.validate(),
            Err(DomainError::StructuralInconsistency(_))
        ));
    }
}
