//! JSON tree files: nested documents and flat node lists.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::application::ApplicationError;
use crate::domain::{DomainError, FlatNode, LoomTree, TreeDocument};
use crate::infrastructure::error::{InfraError, InfraResult};
use crate::infrastructure::traits::FileSystem;

/// A loaded tree plus the generation settings stored beside it.
#[derive(Debug)]
pub struct LoadedTree {
    pub tree: LoomTree,
    pub generation_settings: Option<Value>,
}

pub struct TreeFileStore {
    fs: Arc<dyn FileSystem>,
}

impl TreeFileStore {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    fn read(&self, path: &Path) -> InfraResult<String> {
        self.fs
            .read_to_string(path)
            .map_err(|e| InfraError::io(format!("read {}", path.display()), e))
    }

    fn write(&self, path: &Path, content: &str) -> InfraResult<()> {
        self.fs
            .ensure_parent(path)
            .map_err(|e| InfraError::io(format!("create parent of {}", path.display()), e))?;
        self.fs
            .write(path, content)
            .map_err(|e| InfraError::io(format!("write {}", path.display()), e))
    }

    fn json_err(path: &Path) -> impl FnOnce(serde_json::Error) -> InfraError + '_ {
        move |source| InfraError::Json {
            path: path.display().to_string(),
            source,
        }
    }

    /// Load a nested tree file, wrapped (`{"root": ...}`) or bare.
    #[instrument(level = "debug", skip(self))]
    pub fn load(&self, path: &Path) -> InfraResult<LoadedTree> {
        let content = self.read(path)?;
        let document = TreeDocument::from_json(&content).map_err(Self::json_err(path))?;
        let tree = LoomTree::from_nested(document.root).map_err(domain_err)?;
        debug!("loaded {} nodes", tree.len());
        Ok(LoadedTree {
            tree,
            generation_settings: document.generation_settings,
        })
    }

    pub fn save(
        &self,
        path: &Path,
        tree: &LoomTree,
        generation_settings: Option<Value>,
    ) -> InfraResult<()> {
        let root = tree
            .root()
            .ok_or_else(|| domain_err(DomainError::NotFound("tree has no root".into())))?;
        let nested = tree.to_nested(root).map_err(domain_err)?;
        let document = TreeDocument {
            root: nested,
            generation_settings,
        };
        let json = serde_json::to_string_pretty(&document).map_err(Self::json_err(path))?;
        self.write(path, &json)
    }

    /// Load a flat JSON array of nodes.
    pub fn load_flat(&self, path: &Path) -> InfraResult<LoomTree> {
        let content = self.read(path)?;
        let nodes: Vec<FlatNode> = serde_json::from_str(&content).map_err(Self::json_err(path))?;
        LoomTree::from_flat(nodes).map_err(domain_err)
    }

    pub fn save_flat(&self, path: &Path, nodes: &[FlatNode]) -> InfraResult<()> {
        let json = serde_json::to_string_pretty(nodes).map_err(Self::json_err(path))?;
        self.write(path, &json)
    }
}

fn domain_err(e: DomainError) -> InfraError {
    ApplicationError::from(e).into()
}
