//! Configuration management with layered loading
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. Global config: `$XDG_CONFIG_HOME/loomtree/loomtree.toml`
//! 3. Local config: `<dir>/.loomtree.toml` (usually the working directory)
//! 4. Environment variables: `LOOMTREE_*` prefix

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::application::ApplicationError;
use crate::util::path::expand_env_vars;

/// Multiverse expansion parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExpansionSettings {
    /// Model name passed to the completion engine
    pub engine: String,
    pub max_depth: usize,
    /// Minimum propagated probability mass for automatic expansion
    pub threshold: f64,
    /// Size of the requested next-token distribution
    pub top_logprobs: usize,
    pub temperature: f64,
    /// Expand sibling branches on the rayon pool
    pub parallel: bool,
    /// Abort on the first failing branch instead of collecting failures
    pub fail_fast: bool,
}

impl Default for ExpansionSettings {
    fn default() -> Self {
        Self {
            engine: "davinci-002".into(),
            max_depth: 3,
            threshold: 0.1,
            top_logprobs: 100,
            temperature: 0.0,
            parallel: false,
            fail_fast: false,
        }
    }
}

/// Completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelSettings {
    pub base_url: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            timeout_secs: 60,
        }
    }
}

/// Remote tree-sync server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SyncSettings {
    /// Base URL, e.g. `http://localhost:5000`
    pub server: Option<String>,
    pub tree_id: Option<String>,
    pub token: Option<String>,
    pub author: Option<String>,
}

/// Raw expansion settings for intermediate parsing (`None` = not specified).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawExpansionSettings {
    pub engine: Option<String>,
    pub max_depth: Option<usize>,
    pub threshold: Option<f64>,
    pub top_logprobs: Option<usize>,
    pub temperature: Option<f64>,
    pub parallel: Option<bool>,
    pub fail_fast: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawModelSettings {
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Raw settings for intermediate parsing.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawSettings {
    pub metaprocess_dir: Option<PathBuf>,
    pub expansion: RawExpansionSettings,
    pub model: RawModelSettings,
    pub sync: SyncSettings,
}

/// Unified configuration for loomtree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Directory of metaprocess JSON files
    pub metaprocess_dir: PathBuf,
    pub expansion: ExpansionSettings,
    pub model: ModelSettings,
    pub sync: SyncSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            metaprocess_dir: default_metaprocess_dir(),
            expansion: ExpansionSettings::default(),
            model: ModelSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

fn default_metaprocess_dir() -> PathBuf {
    global_config_dir()
        .map(|dir| dir.join("metaprocesses"))
        .unwrap_or_else(|| PathBuf::from("~/.config/loomtree/metaprocesses"))
}

/// Get the XDG config directory for loomtree.
pub fn global_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "loomtree").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    global_config_dir().map(|dir| dir.join("loomtree.toml"))
}

/// Get the path to the local config file in a directory.
pub fn local_config_path(dir: &Path) -> PathBuf {
    dir.join(".loomtree.toml")
}

/// Load a TOML file into RawSettings for manual merging.
fn load_raw_settings(path: &Path) -> Result<RawSettings, ApplicationError> {
    let content = std::fs::read_to_string(path).map_err(|e| ApplicationError::Config {
        message: format!("read {}: {}", path.display(), e),
    })?;
    toml::from_str(&content).map_err(|e| ApplicationError::Config {
        message: format!("parse {}: {}", path.display(), e),
    })
}

impl ExpansionSettings {
    fn merge(&self, overlay: &RawExpansionSettings) -> Self {
        Self {
            engine: overlay.engine.clone().unwrap_or_else(|| self.engine.clone()),
            max_depth: overlay.max_depth.unwrap_or(self.max_depth),
            threshold: overlay.threshold.unwrap_or(self.threshold),
            top_logprobs: overlay.top_logprobs.unwrap_or(self.top_logprobs),
            temperature: overlay.temperature.unwrap_or(self.temperature),
            parallel: overlay.parallel.unwrap_or(self.parallel),
            fail_fast: overlay.fail_fast.unwrap_or(self.fail_fast),
        }
    }
}

impl ModelSettings {
    fn merge(&self, overlay: &RawModelSettings) -> Self {
        Self {
            base_url: overlay.base_url.clone().unwrap_or_else(|| self.base_url.clone()),
            api_key_env: overlay
                .api_key_env
                .clone()
                .unwrap_or_else(|| self.api_key_env.clone()),
            timeout_secs: overlay.timeout_secs.unwrap_or(self.timeout_secs),
        }
    }
}

impl SyncSettings {
    fn merge(&self, overlay: &SyncSettings) -> Self {
        Self {
            server: overlay.server.clone().or_else(|| self.server.clone()),
            tree_id: overlay.tree_id.clone().or_else(|| self.tree_id.clone()),
            token: overlay.token.clone().or_else(|| self.token.clone()),
            author: overlay.author.clone().or_else(|| self.author.clone()),
        }
    }
}

impl Settings {
    /// Expand shell variables and tilde in path-like fields.
    fn expand_paths(&mut self) {
        let expanded = expand_env_vars(self.metaprocess_dir.to_string_lossy().as_ref());
        self.metaprocess_dir = PathBuf::from(expanded);
    }

    /// Merge overlay config onto self (base): overlay wins where specified.
    fn merge_with(&self, overlay: &RawSettings) -> Self {
        Self {
            metaprocess_dir: overlay
                .metaprocess_dir
                .clone()
                .unwrap_or_else(|| self.metaprocess_dir.clone()),
            expansion: self.expansion.merge(&overlay.expansion),
            model: self.model.merge(&overlay.model),
            sync: self.sync.merge(&overlay.sync),
        }
    }

    /// Load settings with layered precedence.
    ///
    /// # Arguments
    /// * `local_dir` - Optional directory holding a `.loomtree.toml`
    pub fn load(local_dir: Option<&Path>) -> Result<Self, ApplicationError> {
        let mut current = Self::default();

        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                let raw = load_raw_settings(&global_path)?;
                current = current.merge_with(&raw);
            }
        }

        if let Some(dir) = local_dir {
            let local_path = local_config_path(dir);
            if local_path.exists() {
                let raw = load_raw_settings(&local_path)?;
                current = current.merge_with(&raw);
            }
        }

        current = Self::apply_env_overrides(current)?;
        current.expand_paths();

        Ok(current)
    }

    /// Load from one explicit file on top of the defaults (no env overrides).
    pub fn load_file(path: &Path) -> Result<Self, ApplicationError> {
        let raw = load_raw_settings(path)?;
        let mut settings = Self::default().merge_with(&raw);
        settings.expand_paths();
        Ok(settings)
    }

    /// Apply LOOMTREE_* environment variables as explicit overrides.
    ///
    /// Nested keys use `__`, e.g. `LOOMTREE_EXPANSION__MAX_DEPTH=5`.
    fn apply_env_overrides(settings: Self) -> Result<Self, ApplicationError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("LOOMTREE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_err)?;
        Self::apply_config_overrides(settings, &config)
    }

    fn apply_config_overrides(
        mut settings: Self,
        config: &Config,
    ) -> Result<Self, ApplicationError> {
        if let Ok(val) = config.get_string("metaprocess_dir") {
            settings.metaprocess_dir = PathBuf::from(val);
        }
        let raw = RawSettings {
            metaprocess_dir: None,
            expansion: RawExpansionSettings {
                engine: config.get_string("expansion.engine").ok(),
                max_depth: optional(config.get::<usize>("expansion.max_depth"))?,
                threshold: optional(config.get_float("expansion.threshold"))?,
                top_logprobs: optional(config.get::<usize>("expansion.top_logprobs"))?,
                temperature: optional(config.get_float("expansion.temperature"))?,
                parallel: optional(config.get_bool("expansion.parallel"))?,
                fail_fast: optional(config.get_bool("expansion.fail_fast"))?,
            },
            model: RawModelSettings {
                base_url: config.get_string("model.base_url").ok(),
                api_key_env: config.get_string("model.api_key_env").ok(),
                timeout_secs: optional(config.get::<u64>("model.timeout_secs"))?,
            },
            sync: SyncSettings {
                server: config.get_string("sync.server").ok(),
                tree_id: config.get_string("sync.tree_id").ok(),
                token: config.get_string("sync.token").ok(),
                author: config.get_string("sync.author").ok(),
            },
        };
        Ok(settings.merge_with(&raw))
    }

    /// Show the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ApplicationError> {
        toml::to_string_pretty(self).map_err(|e| ApplicationError::Config {
            message: format!("serialize config: {e}"),
        })
    }

    /// Generate a template config file.
    pub fn template() -> String {
        r#"# loomtree configuration
#
# Locations (by precedence, lowest to highest):
#   Global: ~/.config/loomtree/loomtree.toml
#   Local:  ./.loomtree.toml
#   Env:    LOOMTREE_* environment variables, e.g. LOOMTREE_EXPANSION__MAX_DEPTH=5

# Directory of metaprocess recipes (*.json, headers/*.json)
# metaprocess_dir = "~/.config/loomtree/metaprocesses"

[expansion]
# engine = "davinci-002"
# max_depth = 3
# Minimum propagated probability for a branch to be expanded automatically
# threshold = 0.1
# top_logprobs = 100
# temperature = 0.0
# parallel = false
# fail_fast = false

[model]
# base_url = "https://api.openai.com/v1"
# api_key_env = "OPENAI_API_KEY"
# timeout_secs = 60

[sync]
# server = "http://localhost:5000"
# tree_id = "my-tree"
# token = "secret"
# author = "me"
"#
        .to_string()
    }
}

/// A missing key is `None`; a present but unparsable one is an error.
fn optional<T>(result: Result<T, ConfigError>) -> Result<Option<T>, ApplicationError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(config_err(e)),
    }
}

fn config_err(e: ConfigError) -> ApplicationError {
    ApplicationError::Config {
        message: e.to_string(),
    }
}
