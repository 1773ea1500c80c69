//! Downward traversals and the pruned copies built from them.
//!
//! Every builder walks the arena with an explicit stack, records the visited
//! nodes in pre-order together with the position of their parent, and then
//! folds that list back into a nested `TreeView`. Depth of the loom never
//! translates into call-stack depth.

use std::collections::{BTreeMap, HashMap, HashSet};

use generational_arena::Index;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::domain::arena::LoomTree;
use crate::domain::error::{DomainError, TreeResult};
use crate::domain::node::{Node, NodeId};

/// Per-node predicate used to prune traversals.
pub type NodeFilter<'a> = &'a dyn Fn(&Node) -> bool;

/// Pruned copy of (part of) a loom: ids, child lists and requested attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeView {
    pub id: NodeId,
    #[serde(default)]
    pub children: Vec<TreeView>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

impl TreeView {
    fn of(node: &Node, copy_attributes: &[&str]) -> Self {
        let attributes = copy_attributes
            .iter()
            .filter_map(|name| node.attribute(name).map(|v| (name.to_string(), v)))
            .collect();
        Self {
            id: node.id.clone(),
            children: Vec::new(),
            attributes,
        }
    }

    /// Number of nodes in the view.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(view) = stack.pop() {
            count += 1;
            stack.extend(view.children.iter());
        }
        count
    }

    /// Ids of all nodes in the view, pre-order.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut stack = vec![self];
        while let Some(view) = stack.pop() {
            ids.push(view.id.clone());
            stack.extend(view.children.iter().rev());
        }
        ids
    }
}

/// Fold a pre-order list of `(parent position, item)` back into a nested value.
///
/// Parents always precede their descendants, so draining from the back attaches
/// every finished subtree to a parent that is still in the list.
pub(crate) fn assemble<T>(
    mut order: Vec<(Option<usize>, T)>,
    children_of: impl Fn(&mut T) -> &mut Vec<T>,
) -> Option<T> {
    let mut root = None;
    while let Some((parent, mut item)) = order.pop() {
        children_of(&mut item).reverse();
        match parent {
            Some(pos) => children_of(&mut order[pos].1).push(item),
            None => root = Some(item),
        }
    }
    root
}

fn passes(filter: Option<NodeFilter<'_>>, node: &Node) -> bool {
    filter.map_or(true, |f| f(node))
}

impl LoomTree {
    /// Walk from `root`, letting `expand` choose which children to follow and
    /// with what state, and build the resulting view.
    fn project<S>(
        &self,
        root: Index,
        state: S,
        copy_attributes: &[&str],
        mut expand: impl FnMut(Index, &Node, &S) -> TreeResult<Vec<(Index, S)>>,
    ) -> TreeResult<TreeView> {
        let mut order: Vec<(Option<usize>, TreeView)> = Vec::new();
        let mut stack = vec![(root, state, None)];
        while let Some((idx, state, parent_pos)) = stack.pop() {
            if order.len() >= self.len() {
                return Err(DomainError::StructuralInconsistency(format!(
                    "cycle below {:?}",
                    root
                )));
            }
            let node = self.node(idx)?;
            let pos = order.len();
            order.push((parent_pos, TreeView::of(node, copy_attributes)));
            for (child, child_state) in expand(idx, node, &state)?.into_iter().rev() {
                stack.push((child, child_state, Some(pos)));
            }
        }
        assemble(order, |view| &mut view.children)
            .ok_or_else(|| DomainError::StructuralInconsistency("empty projection".into()))
    }

    /// Children of `node` that pass `filter`, in branch order.
    pub fn filtered_children(
        &self,
        idx: Index,
        filter: Option<NodeFilter<'_>>,
    ) -> TreeResult<Vec<Index>> {
        let mut kept = Vec::new();
        for &child in &self.node(idx)?.children {
            if passes(filter, self.node(child)?) {
                kept.push(child);
            }
        }
        Ok(kept)
    }

    /// Pre-order list of `root` and the descendants reachable through `filter`.
    ///
    /// The root itself is not tested. `Some(0)` yields nothing, `None` means no
    /// depth limit.
    #[instrument(level = "trace", skip(self, filter))]
    pub fn subtree_list(
        &self,
        root: Index,
        filter: Option<NodeFilter<'_>>,
        depth_limit: Option<usize>,
    ) -> TreeResult<Vec<Index>> {
        if depth_limit == Some(0) {
            return Ok(Vec::new());
        }
        let mut visited = Vec::new();
        let mut stack = vec![(root, 1usize)];
        while let Some((idx, level)) = stack.pop() {
            if visited.len() >= self.len() {
                return Err(DomainError::StructuralInconsistency(format!(
                    "cycle below {:?}",
                    root
                )));
            }
            let node = self.node(idx)?;
            visited.push(idx);
            if depth_limit.is_some_and(|limit| level >= limit) {
                continue;
            }
            for &child in node.children.iter().rev() {
                if passes(filter, self.node(child)?) {
                    stack.push((child, level + 1));
                }
            }
        }
        Ok(visited)
    }

    pub fn num_descendants(
        &self,
        root: Index,
        filter: Option<NodeFilter<'_>>,
    ) -> TreeResult<usize> {
        Ok(self.subtree_list(root, filter, None)?.len())
    }

    /// Copy of `root` and every descendant that passes `filter` at each step.
    ///
    /// The caller guarantees that `root` itself satisfies the filter.
    #[instrument(level = "debug", skip(self, filter))]
    pub fn tree_subset(
        &self,
        root: Index,
        filter: Option<NodeFilter<'_>>,
        copy_attributes: &[&str],
    ) -> TreeResult<TreeView> {
        self.project(root, (), copy_attributes, |idx, _, _| {
            Ok(self
                .filtered_children(idx, filter)?
                .into_iter()
                .map(|child| (child, ()))
                .collect())
        })
    }

    /// Flattened `tree_subset`: every node of the subset keyed by id, each with
    /// its own pruned subtree.
    pub fn conditional_index(
        &self,
        root: Index,
        filter: Option<NodeFilter<'_>>,
    ) -> TreeResult<HashMap<NodeId, TreeView>> {
        let subset = self.tree_subset(root, filter, &[])?;
        let mut index = HashMap::new();
        let mut stack = vec![&subset];
        while let Some(view) = stack.pop() {
            index.insert(view.id.clone(), view.clone());
            stack.extend(view.children.iter());
        }
        Ok(index)
    }

    /// Copy of the nodes within `depth_limit` levels below `root`.
    pub fn depth_limited_tree(&self, root: Index, depth_limit: usize) -> TreeResult<TreeView> {
        self.project(root, depth_limit, &[], |_, node, &remaining| {
            Ok(if remaining == 0 {
                Vec::new()
            } else {
                node.children.iter().map(|&c| (c, remaining - 1)).collect()
            })
        })
    }

    /// The path in `ancestry` fully explored, every branch leaving it cut to
    /// `depth_limit` levels from the point where it diverges.
    ///
    /// `ancestry` starts at `root`.
    #[instrument(level = "debug", skip(self))]
    pub fn limited_branching_tree(
        &self,
        ancestry: &[Index],
        root: Index,
        depth_limit: usize,
    ) -> TreeResult<TreeView> {
        self.project(root, Focus::OnPath(0), &[], |_, node, focus| {
            Ok(match *focus {
                Focus::OnPath(pos) if pos + 1 < ancestry.len() => {
                    let next = ancestry[pos + 1];
                    node.children
                        .iter()
                        .filter_map(|&child| {
                            if child == next {
                                Some((child, Focus::OnPath(pos + 1)))
                            } else if depth_limit > 0 {
                                Some((child, Focus::Limited(depth_limit - 1)))
                            } else {
                                None
                            }
                        })
                        .collect()
                }
                Focus::OnPath(_) => limited(node, depth_limit),
                Focus::Limited(remaining) => limited(node, remaining),
            })
        })
    }

    /// Only the path in `ancestry` down to `current`, then `depth_limit` levels
    /// below it.
    pub fn collapsed_wavefunction(
        &self,
        ancestry: &[Index],
        root: Index,
        current: Index,
        depth_limit: usize,
    ) -> TreeResult<TreeView> {
        self.project(root, Focus::OnPath(0), &[], |idx, node, focus| {
            Ok(match *focus {
                Focus::OnPath(pos) if pos + 1 < ancestry.len() && idx != current => {
                    let next = ancestry[pos + 1];
                    node.children
                        .iter()
                        .filter(|&&child| child == next)
                        .map(|&child| (child, Focus::OnPath(pos + 1)))
                        .collect()
                }
                Focus::OnPath(_) => limited(node, depth_limit),
                Focus::Limited(remaining) => limited(node, remaining),
            })
        })
    }

    /// Nodes within `distance_limit` edges of `reference`.
    ///
    /// If `root` is farther away than that, the view is rooted at the ancestor
    /// of `reference` exactly `distance_limit` levels up.
    pub fn limited_distance_tree(
        &self,
        root: Index,
        reference: Index,
        distance_limit: usize,
    ) -> TreeResult<TreeView> {
        let mut near = HashSet::new();
        for (idx, node) in self.iter() {
            if self.path_distance(reference, idx)? <= distance_limit {
                near.insert(node.id.clone());
            }
        }
        let mut root = root;
        if !near.contains(&self.node(root)?.id) {
            let lineage = self.ancestry(reference)?;
            let up = lineage.len().saturating_sub(distance_limit + 1);
            root = lineage[up];
        }
        let filter = |node: &Node| near.contains(&node.id);
        self.tree_subset(root, Some(&filter), &[])
    }
}

#[derive(Debug, Clone, Copy)]
enum Focus {
    OnPath(usize),
    Limited(usize),
}

fn limited(node: &Node, remaining: usize) -> Vec<(Index, Focus)> {
    if remaining == 0 {
        return Vec::new();
    }
    node.children
        .iter()
        .map(|&c| (c, Focus::Limited(remaining - 1)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_pre_order_list_when_assembling_then_children_keep_order() {
        #[derive(Debug)]
        struct Item(&'static str, Vec<Item>);
        let order = vec![
            (None, Item("r", vec![])),
            (Some(0), Item("a", vec![])),
            (Some(1), Item("c", vec![])),
            (Some(0), Item("b", vec![])),
        ];
        let root = assemble(order, |item| &mut item.1).unwrap();
        let names: Vec<&str> = root.1.iter().map(|i| i.0).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(root.1[0].1[0].0, "c");
    }

    #[test]
    fn given_view_when_listing_ids_then_pre_order() {
        let mut tree = LoomTree::new();
        let r = tree.insert_with_id("r".into(), "", None).unwrap();
        let a = tree.insert_with_id("a".into(), "", Some(r)).unwrap();
        tree.insert_with_id("b".into(), "", Some(r)).unwrap();
        tree.insert_with_id("c".into(), "", Some(a)).unwrap();
        let view = tree.tree_subset(r, None, &[]).unwrap();
        let ids: Vec<String> = view.ids().iter().map(|i| i.to_string()).collect();
        assert_eq!(ids, vec!["r", "a", "c", "b"]);
        assert_eq!(view.node_count(), 4);
    }
}
