//! Application layer: expansion, metaprocesses and sync
//!
//! This layer orchestrates domain logic and depends on I/O boundary traits.

pub mod error;
pub mod error_ext;
pub mod metaprocess;
pub mod multiverse;
pub mod sync;

pub use error::{ApplicationError, ApplicationResult};
pub use error_ext::IoResultExt;
pub use metaprocess::{
    CapabilityBundle, Metaprocess, MetaprocessOutput, MetaprocessRegistry, OutputType,
    TextTransform,
};
pub use multiverse::{ExpansionNode, ExpansionOutcome, ExpansionStatus, MultiverseExpander};
pub use sync::{RemoteNode, SyncClient, Upsert};
