//! Nested and flat serialized forms of a loom, and conversions between them.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use generational_arena::Index;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::domain::arena::LoomTree;
use crate::domain::error::{DomainError, TreeResult};
use crate::domain::node::{NodeId, NodeMeta};
use crate::domain::view::assemble;

fn default_true() -> bool {
    true
}

fn is_true(b: &bool) -> bool {
    *b
}

/// Nested `{text, children: [...]}` literal, the on-disk tree format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
    #[serde(default)]
    pub text: String,
    #[serde(default, alias = "parentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub children: Vec<NestedNode>,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub mutable: bool,
    #[serde(default, skip_serializing_if = "meta_is_empty")]
    pub meta: NodeMeta,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

fn meta_is_empty(meta: &NodeMeta) -> bool {
    meta.creation_timestamp.is_none()
}

impl NestedNode {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            parent_id: None,
            children: Vec::new(),
            mutable: true,
            meta: NodeMeta::default(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<NestedNode>) -> Self {
        self.children = children;
        self
    }
}

/// One entry of a flattened loom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatNode {
    pub id: NodeId,
    #[serde(default)]
    pub text: String,
    #[serde(default, alias = "parentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    /// Child ids in branch order
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default = "default_true")]
    pub mutable: bool,
    #[serde(default)]
    pub meta: NodeMeta,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

/// Text-only shape of a loom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleNode {
    pub text: String,
    pub children: Vec<SimpleNode>,
}

/// A tree file: the root plus optional generation settings.
///
/// Bare node documents (without the `root` wrapper) are accepted on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDocument {
    pub root: NestedNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_settings: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentShape {
    Wrapped(TreeDocument),
    Bare(NestedNode),
}

impl TreeDocument {
    pub fn new(root: NestedNode) -> Self {
        Self {
            root,
            generation_settings: None,
        }
    }

    /// Parse either shape of tree file.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        Ok(match serde_json::from_str(json)? {
            DocumentShape::Wrapped(doc) => doc,
            DocumentShape::Bare(root) => Self::new(root),
        })
    }
}

/// Flatten a nested tree into pre-order entries.
///
/// Nodes without an id get a fresh one and every child records its parent's
/// id. `reverse` flips the order siblings appear in the list; each entry's
/// child list keeps the structural order.
#[instrument(level = "debug", skip(nested))]
pub fn flatten_tree(nested: NestedNode, reverse: bool) -> Vec<FlatNode> {
    let mut flat = Vec::new();
    let mut stack = vec![nested];
    while let Some(mut node) = stack.pop() {
        let id = node.id.take().unwrap_or_else(NodeId::generate);
        let mut children = std::mem::take(&mut node.children);
        for child in children.iter_mut() {
            if child.id.is_none() {
                child.id = Some(NodeId::generate());
            }
            child.parent_id = Some(id.clone());
        }
        let child_ids = children.iter().filter_map(|c| c.id.clone()).collect();

        flat.push(FlatNode {
            id,
            text: node.text,
            parent_id: node.parent_id,
            children: child_ids,
            mutable: node.mutable,
            meta: node.meta,
            attributes: node.attributes,
        });

        // the stack pops last-in first, so push in the opposite of visit order
        if reverse {
            stack.extend(children);
        } else {
            stack.extend(children.into_iter().rev());
        }
    }
    flat
}

impl LoomTree {
    /// Rebuild a tree from flat entries, validating every structural invariant.
    ///
    /// `parent_id` is authoritative. A non-empty child list must name exactly
    /// the entries pointing at that parent and fixes their order; otherwise
    /// list order is used.
    #[instrument(level = "debug", skip(nodes), fields(count = nodes.len()))]
    pub fn from_flat(nodes: Vec<FlatNode>) -> TreeResult<Self> {
        let mut by_id: HashMap<NodeId, FlatNode> = HashMap::with_capacity(nodes.len());
        let mut order: Vec<NodeId> = Vec::with_capacity(nodes.len());
        let mut roots = Vec::new();
        for node in nodes {
            if by_id.contains_key(&node.id) {
                return Err(DomainError::StructuralInconsistency(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
            if node.parent_id.is_none() {
                roots.push(node.id.clone());
            }
            order.push(node.id.clone());
            by_id.insert(node.id.clone(), node);
        }
        if by_id.is_empty() {
            return Ok(Self::new());
        }
        if roots.len() != 1 {
            return Err(DomainError::StructuralInconsistency(format!(
                "expected exactly one root, found {}",
                roots.len()
            )));
        }

        let mut claimed: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for id in &order {
            if let Some(parent_id) = &by_id[id].parent_id {
                if !by_id.contains_key(parent_id) {
                    return Err(DomainError::StructuralInconsistency(format!(
                        "parent {parent_id} of {id} is missing"
                    )));
                }
                claimed.entry(parent_id.clone()).or_default().push(id.clone());
            }
        }

        let mut tree = Self::new();
        let mut queue = VecDeque::from([(roots[0].clone(), None)]);
        while let Some((id, parent_idx)) = queue.pop_front() {
            let mut entry = by_id.remove(&id).ok_or_else(|| {
                DomainError::StructuralInconsistency(format!("{id} reached twice"))
            })?;
            let idx = tree.insert_with_id(id.clone(), std::mem::take(&mut entry.text), parent_idx)?;
            let node = tree.node_mut(idx)?;
            node.mutable = entry.mutable;
            node.meta = entry.meta;
            node.attributes = entry.attributes;

            let pointing = claimed.remove(&id).unwrap_or_default();
            let children = if entry.children.is_empty() {
                pointing
            } else {
                let listed: HashSet<&NodeId> = entry.children.iter().collect();
                let actual: HashSet<&NodeId> = pointing.iter().collect();
                if listed != actual || listed.len() != entry.children.len() {
                    return Err(DomainError::StructuralInconsistency(format!(
                        "child list of {id} disagrees with parent links"
                    )));
                }
                entry.children
            };
            queue.extend(children.into_iter().map(|child| (child, Some(idx))));
        }

        if !by_id.is_empty() {
            return Err(DomainError::StructuralInconsistency(format!(
                "{} nodes unreachable from root",
                by_id.len()
            )));
        }
        debug!("rebuilt tree with {} nodes", tree.len());
        Ok(tree)
    }

    pub fn from_nested(nested: NestedNode) -> TreeResult<Self> {
        let mut nested = nested;
        nested.parent_id = None;
        Self::from_flat(flatten_tree(nested, false))
    }

    /// Flat entries of the subtree at `root`, pre-order.
    pub fn to_flat(&self, root: Index) -> TreeResult<Vec<FlatNode>> {
        let mut flat = Vec::new();
        for (idx, node) in self.iter_from(root) {
            let parent_id = match node.parent {
                Some(parent) if idx != root => Some(self.node(parent)?.id.clone()),
                _ => None,
            };
            let mut children = Vec::with_capacity(node.children.len());
            for &child in &node.children {
                children.push(self.node(child)?.id.clone());
            }
            flat.push(FlatNode {
                id: node.id.clone(),
                text: node.text.clone(),
                parent_id,
                children,
                mutable: node.mutable,
                meta: node.meta.clone(),
                attributes: node.attributes.clone(),
            });
        }
        Ok(flat)
    }

    /// Nested copy of the subtree at `root`, ids included.
    pub fn to_nested(&self, root: Index) -> TreeResult<NestedNode> {
        let mut order = Vec::new();
        let mut positions: HashMap<Index, usize> = HashMap::new();
        for (idx, node) in self.iter_from(root) {
            let parent_pos = node.parent.and_then(|p| positions.get(&p).copied());
            positions.insert(idx, order.len());
            order.push((
                parent_pos,
                NestedNode {
                    id: Some(node.id.clone()),
                    text: node.text.clone(),
                    parent_id: None,
                    children: Vec::new(),
                    mutable: node.mutable,
                    meta: node.meta.clone(),
                    attributes: node.attributes.clone(),
                },
            ));
        }
        assemble(order, |n| &mut n.children)
            .ok_or_else(|| DomainError::NotFound(format!("node handle {root:?}")))
    }

    /// Text-only copy of the subtree at `root`.
    pub fn to_simple(&self, root: Index) -> TreeResult<SimpleNode> {
        let mut order = Vec::new();
        let mut positions: HashMap<Index, usize> = HashMap::new();
        for (idx, node) in self.iter_from(root) {
            let parent_pos = node.parent.and_then(|p| positions.get(&p).copied());
            positions.insert(idx, order.len());
            order.push((
                parent_pos,
                SimpleNode {
                    text: node.text.clone(),
                    children: Vec::new(),
                },
            ));
        }
        assemble(order, |n| &mut n.children)
            .ok_or_else(|| DomainError::NotFound(format!("node handle {root:?}")))
    }
}
