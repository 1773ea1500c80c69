//! Text search over a subtree.

use std::collections::HashSet;

use generational_arena::Index;
use regex::RegexBuilder;
use serde::Serialize;
use tracing::instrument;

use crate::domain::arena::LoomTree;
use crate::domain::error::{DomainError, TreeResult};
use crate::domain::node::NodeId;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub case_sensitive: bool,
    /// Treat the pattern as a regular expression instead of a literal substring
    pub regex: bool,
    /// Only nodes in this set produce matches
    pub allow: Option<HashSet<NodeId>>,
    /// `None` searches the whole subtree; `Some(0)` searches nothing
    pub max_depth: Option<usize>,
}

/// One occurrence of the pattern in a node's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub node_id: NodeId,
    /// Byte offsets into the node text
    pub span: (usize, usize),
    pub matched: String,
}

impl LoomTree {
    /// All matches of `pattern` in `root` and its descendants, pre-order.
    ///
    /// Nodes outside the allow-set contribute nothing but are still descended
    /// into, within the depth limit.
    #[instrument(level = "debug", skip(self, options))]
    pub fn search(
        &self,
        root: Index,
        pattern: &str,
        options: &SearchOptions,
    ) -> TreeResult<Vec<SearchMatch>> {
        if options.max_depth == Some(0) {
            return Ok(Vec::new());
        }
        let source = if options.regex {
            pattern.to_string()
        } else {
            regex::escape(pattern)
        };
        let matcher = RegexBuilder::new(&source)
            .case_insensitive(!options.case_sensitive)
            .build()
            .map_err(|e| DomainError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;

        let mut matches = Vec::new();
        for idx in self.subtree_list(root, None, options.max_depth)? {
            let node = self.node(idx)?;
            if options
                .allow
                .as_ref()
                .is_some_and(|allow| !allow.contains(&node.id))
            {
                continue;
            }
            matches.extend(matcher.find_iter(&node.text).map(|m| SearchMatch {
                node_id: node.id.clone(),
                span: (m.start(), m.end()),
                matched: m.as_str().to_string(),
            }));
        }
        Ok(matches)
    }
}
