//! Application-level errors (wraps domain errors)

use thiserror::Error;

use crate::domain::DomainError;
use crate::infrastructure::error::TransportError;

/// Application errors wrap domain errors and add application-level context.
#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("{0}")]
    Domain(#[from] DomainError),

    #[error("model call failed at {context}: {source}")]
    ModelCall {
        context: String,
        #[source]
        source: TransportError,
    },

    #[error("sync server error ({status}): {message}")]
    Sync { status: u16, message: String },

    #[error("metaprocess error: {0}")]
    Metaprocess(String),

    #[error("config error: {message}")]
    Config { message: String },

    #[error("operation failed: {context}")]
    OperationFailed {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ApplicationError {
    pub fn model_call(context: impl Into<String>, source: TransportError) -> Self {
        Self::ModelCall {
            context: context.into(),
            source,
        }
    }
}

/// Result type for application layer operations.
pub type ApplicationResult<T> = Result<T, ApplicationError>;
