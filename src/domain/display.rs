//! Terminal rendering of a loom as a `termtree`.

use std::collections::HashMap;

use generational_arena::Index;
use termtree::Tree;
use tracing::instrument;

use crate::domain::arena::LoomTree;
use crate::domain::error::TreeResult;
use crate::domain::node::Node;

const LABEL_WIDTH: usize = 60;

/// One-line label: shortened text and id.
pub fn node_label(node: &Node) -> String {
    let text: String = node.text.chars().take(LABEL_WIDTH).collect();
    let ellipsis = if node.text.chars().count() > LABEL_WIDTH { "…" } else { "" };
    format!("{:?}{} [{}]", text, ellipsis, node.id())
}

impl LoomTree {
    /// `root` and its descendants down to `depth_limit` levels (all when `None`).
    #[instrument(level = "debug", skip(self))]
    pub fn to_tree_string(
        &self,
        root: Index,
        depth_limit: Option<usize>,
    ) -> TreeResult<Tree<String>> {
        let mut order = Vec::new();
        let mut stack = vec![(root, 0usize)];
        while let Some((idx, depth)) = stack.pop() {
            if order.len() > self.len() {
                break;
            }
            let node = self.node(idx)?;
            order.push(idx);
            if depth_limit.map_or(true, |limit| depth < limit) {
                stack.extend(node.children().iter().rev().map(|&child| (child, depth + 1)));
            }
        }

        let mut built: HashMap<Index, Tree<String>> = HashMap::with_capacity(order.len());
        for &idx in order.iter().rev() {
            let node = self.node(idx)?;
            let leaves: Vec<_> = node
                .children()
                .iter()
                .filter_map(|child| built.remove(child))
                .collect();
            built.insert(idx, Tree::new(node_label(node)).with_leaves(leaves));
        }
        Ok(built
            .remove(&root)
            .unwrap_or_else(|| Tree::new("Empty tree".to_string())))
    }
}
