//! Service container for dependency injection
//!
//! Wires up all services with their dependencies.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::application::{ApplicationError, MetaprocessRegistry, MultiverseExpander, SyncClient};
use crate::config::{ExpansionSettings, Settings};
use crate::infrastructure::error::{InfraError, InfraResult, TransportError};
use crate::infrastructure::http::HttpTransport;
use crate::infrastructure::openai::OpenAiEngine;
use crate::infrastructure::store::TreeFileStore;
use crate::infrastructure::traits::{CompletionEngine, FileSystem, RealFileSystem, SyncTransport};

/// Container holding all application services.
///
/// The completion engine is created lazily and cached; commands that never
/// call the model never need an API key.
pub struct ServiceContainer {
    /// Application settings
    pub settings: Arc<Settings>,

    /// Filesystem abstraction
    pub fs: Arc<dyn FileSystem>,

    engine: OnceLock<Arc<dyn CompletionEngine>>,
    transport: Option<Arc<dyn SyncTransport>>,
}

impl ServiceContainer {
    /// Create a new service container with real implementations.
    pub fn new(settings: Settings) -> Self {
        Self::with_deps(settings, Arc::new(RealFileSystem))
    }

    /// Create a service container with custom dependencies (for testing).
    pub fn with_deps(settings: Settings, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            settings: Arc::new(settings),
            fs,
            engine: OnceLock::new(),
            transport: None,
        }
    }

    /// Use `engine` instead of the configured one; a later call replaces an
    /// earlier one.
    pub fn with_engine(mut self, engine: Arc<dyn CompletionEngine>) -> Self {
        self.engine = OnceLock::from(engine);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(&self) -> TreeFileStore {
        TreeFileStore::new(self.fs.clone())
    }

    pub fn engine(&self) -> InfraResult<Arc<dyn CompletionEngine>> {
        if let Some(engine) = self.engine.get() {
            return Ok(engine.clone());
        }
        let engine = OpenAiEngine::new(&self.settings.model)
            .map_err(|e| transport_err("completion engine", e))?;
        let engine: Arc<dyn CompletionEngine> = Arc::new(engine);
        Ok(self.engine.get_or_init(|| engine).clone())
    }

    /// Expander over the shared engine, with `settings` (the configured
    /// `expansion` section plus any per-call overrides).
    pub fn expander(&self, settings: ExpansionSettings) -> InfraResult<MultiverseExpander> {
        Ok(MultiverseExpander::new(self.engine()?, settings))
    }

    /// Registry loaded from the configured metaprocess directory.
    pub fn registry(&self) -> InfraResult<MetaprocessRegistry> {
        let mut registry = MetaprocessRegistry::new(
            self.fs.clone(),
            self.engine()?,
            self.settings.metaprocess_dir.clone(),
        );
        registry.load()?;
        Ok(registry)
    }

    pub fn sync_client(&self) -> InfraResult<SyncClient> {
        let sync = &self.settings.sync;
        let missing = |key: &str| ApplicationError::Config {
            message: format!("sync.{key} is not configured"),
        };
        let tree_id = sync.tree_id.clone().ok_or_else(|| missing("tree_id"))?;
        let token = sync.token.clone().ok_or_else(|| missing("token"))?;
        let transport: Arc<dyn SyncTransport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => {
                let server = sync.server.as_deref().ok_or_else(|| missing("server"))?;
                let timeout = Duration::from_secs(self.settings.model.timeout_secs);
                let transport = HttpTransport::new(server, timeout)
                    .map_err(|e| transport_err("sync transport", e))?;
                Arc::new(transport)
            }
        };
        let client = SyncClient::new(transport, tree_id, token);
        Ok(match &sync.author {
            Some(author) => client.with_author(author.clone()),
            None => client,
        })
    }
}

fn transport_err(context: &str, e: TransportError) -> InfraError {
    ApplicationError::OperationFailed {
        context: context.to_string(),
        source: Box::new(e),
    }
    .into()
}
