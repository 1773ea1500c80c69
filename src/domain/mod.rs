//! Domain layer: the loom tree store
//!
//! This layer is independent of external concerns (no I/O, no CLI, no config loading).

pub mod ancestry;
pub mod arena;
pub mod display;
pub mod error;
pub mod flatten;
pub mod node;
pub mod overwrite;
pub mod search;
pub mod view;
pub mod walk;

pub use arena::{LoomTree, PostOrderIterator, TreeIterator};
pub use display::node_label;
pub use error::{DomainError, TreeResult};
pub use flatten::{flatten_tree, FlatNode, NestedNode, SimpleNode, TreeDocument};
pub use node::{Node, NodeId, NodeMeta, TEXT_ATTRIBUTE, TIMESTAMP_FORMAT};
pub use search::{SearchMatch, SearchOptions};
pub use view::{NodeFilter, TreeView};
pub use walk::TransitionMode;
