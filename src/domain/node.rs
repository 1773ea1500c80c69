//! Node payload types for the loom tree.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Local, NaiveDateTime};
use generational_arena::Index;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::{DomainError, TreeResult};

/// Format of `meta.creation_timestamp`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H.%M.%S";

/// Reserved attribute name that addresses the node text in bulk operations.
pub const TEXT_ATTRIBUTE: &str = "text";

/// Opaque node identifier. Assigned once, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Creation metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
}

impl NodeMeta {
    /// Metadata stamped with the current local time.
    pub fn now() -> Self {
        Self {
            creation_timestamp: Some(Local::now().format(TIMESTAMP_FORMAT).to_string()),
        }
    }

    pub(crate) fn parsed_timestamp(&self, node: &NodeId) -> TreeResult<NaiveDateTime> {
        let raw = self
            .creation_timestamp
            .as_deref()
            .ok_or_else(|| DomainError::MissingTimestamp(node.to_string()))?;
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|_| {
            DomainError::InvalidTimestamp {
                node: node.to_string(),
                value: raw.to_string(),
            }
        })
    }
}

/// Tree node in the arena-based loom.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub text: String,
    /// Index of parent node in the arena, None for the root
    pub(crate) parent: Option<Index>,
    /// Indices of child nodes in the arena, in canonical branch order
    pub(crate) children: Vec<Index>,
    pub mutable: bool,
    pub meta: NodeMeta,
    /// Free-form attributes (`visited`, `bookmark`, expansion probabilities, ...)
    pub attributes: BTreeMap<String, Value>,
}

impl Node {
    pub(crate) fn new(id: NodeId, text: String, parent: Option<Index>) -> Self {
        Self {
            id,
            text,
            parent,
            children: Vec::new(),
            mutable: true,
            meta: NodeMeta::default(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn parent(&self) -> Option<Index> {
        self.parent
    }

    pub fn children(&self) -> &[Index] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Attribute value; `text` resolves to the node text.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        if name == TEXT_ATTRIBUTE {
            Some(Value::String(self.text.clone()))
        } else {
            self.attributes.get(name).cloned()
        }
    }

    pub(crate) fn set_attribute(&mut self, name: &str, value: Value) -> TreeResult<()> {
        if name == TEXT_ATTRIBUTE {
            match value {
                Value::String(text) => self.text = text,
                other => {
                    return Err(DomainError::PreconditionViolated(format!(
                        "text attribute must be a string, got {other}"
                    )))
                }
            }
        } else {
            self.attributes.insert(name.to_string(), value);
        }
        Ok(())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.text)
    }
}
