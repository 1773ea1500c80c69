//! Subtree-wide attribute flood fill.

use generational_arena::Index;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::domain::arena::LoomTree;
use crate::domain::error::{DomainError, TreeResult};
use crate::domain::node::{Node, TEXT_ATTRIBUTE};

fn is_blocked(
    node: &Node,
    attribute: &str,
    new_value: &Value,
    old_value: Option<&Value>,
    force: bool,
) -> bool {
    if force {
        return false;
    }
    if attribute == TEXT_ATTRIBUTE && !node.mutable {
        return true;
    }
    match node.attribute(attribute) {
        None => false,
        Some(current) => &current != new_value && old_value.map_or(true, |old| &current != old),
    }
}

impl LoomTree {
    /// Set `attribute` to `new_value` on `root` and its descendants, stopping at
    /// any node that already carries a different customization.
    ///
    /// A node is blocked when it holds a value other than `new_value` and other
    /// than `old_value`; setting `text` is also blocked on immutable nodes. Blocked
    /// nodes are left untouched, their subtrees are not visited, and they are
    /// returned. `force` disables every block.
    #[instrument(level = "debug", skip(self, new_value, old_value))]
    pub fn overwrite_subtree(
        &mut self,
        root: Index,
        attribute: &str,
        new_value: &Value,
        old_value: Option<&Value>,
        force: bool,
    ) -> TreeResult<Vec<Index>> {
        let mut blocked = Vec::new();
        let mut stack = vec![root];
        let mut visits = 0;
        while let Some(idx) = stack.pop() {
            visits += 1;
            if visits > self.len() {
                return Err(DomainError::StructuralInconsistency(format!(
                    "cycle below {:?}",
                    root
                )));
            }
            let node = self.node_mut(idx)?;
            if is_blocked(node, attribute, new_value, old_value, force) {
                blocked.push(idx);
                continue;
            }
            node.set_attribute(attribute, new_value.clone())?;
            stack.extend(node.children.iter().rev().copied());
        }
        debug!("overwrite of '{}' blocked at {} nodes", attribute, blocked.len());
        Ok(blocked)
    }
}
