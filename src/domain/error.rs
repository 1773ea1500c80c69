//! Domain-level errors (no external dependencies)

use thiserror::Error;

/// Domain errors represent structural or contract violations on a loom tree.
/// They are never swallowed: a broken tree yields wrong ancestries and distances.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("structural inconsistency: {0}")]
    StructuralInconsistency(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("invalid transition weights: {0}")]
    InvalidWeights(String),

    #[error("node has no creation timestamp: {0}")]
    MissingTimestamp(String),

    #[error("invalid creation timestamp '{value}' on node {node}")]
    InvalidTimestamp { node: String, value: String },

    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    #[error("invalid search pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Result type for tree operations.
pub type TreeResult<T> = Result<T, DomainError>;
