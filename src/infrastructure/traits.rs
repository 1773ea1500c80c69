//! I/O boundary traits for testability
//!
//! These traits abstract external collaborators (filesystem, language model,
//! sync server, recipe index), allowing services to be tested with scripted
//! implementations.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::metaprocess::Metaprocess;
use crate::infrastructure::error::TransportError;

/// Filesystem abstraction for testability.
pub trait FileSystem: Send + Sync {
    /// Read file contents to string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Write string content to file.
    fn write(&self, path: &Path, content: &str) -> io::Result<()>;

    /// Check if path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Check if path is a directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Create directory and all parent directories.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Entries of a directory, sorted by path.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Create parent directories if needed.
    fn ensure_parent(&self, path: &Path) -> io::Result<()>;
}

/// Parameters of one completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub engine: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Number of ranked alternatives to report for the first token
    pub top_logprobs: usize,
    /// Number of independent completions
    pub n: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl CompletionRequest {
    /// Single-token request used for next-token distributions.
    pub fn next_token(
        prompt: impl Into<String>,
        engine: impl Into<String>,
        top_logprobs: usize,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            engine: engine.into(),
            max_tokens: 1,
            temperature: 0.0,
            top_logprobs,
            n: 1,
            stop: None,
        }
    }
}

/// One ranked candidate of a next-token distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
    pub token: String,
    pub logprob: f64,
}

impl TokenLogprob {
    pub fn new(token: impl Into<String>, logprob: f64) -> Self {
        Self {
            token: token.into(),
            logprob,
        }
    }
}

/// Result of a text generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// One text per requested completion
    pub texts: Vec<String>,
    /// Ranked alternatives for the first generated token of the first completion
    pub first_token_logprobs: Vec<TokenLogprob>,
}

/// Language-model completion collaborator.
pub trait CompletionEngine: Send + Sync {
    /// Ranked next-token candidates at `request.prompt`, best first.
    fn top_logprobs(
        &self,
        request: &CompletionRequest,
    ) -> Result<Vec<TokenLogprob>, TransportError>;

    /// Probability of `token` following `prompt`, when the engine can score
    /// tokens outside its top-k list.
    fn score_token(
        &self,
        _prompt: &str,
        _token: &str,
        _engine: &str,
    ) -> Result<Option<f64>, TransportError> {
        Ok(None)
    }

    /// Plain text completions.
    fn generate(&self, request: &CompletionRequest) -> Result<Completion, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Request to the tree-sync server; `path` is relative to the server root.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub method: HttpMethod,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncResponse {
    pub status: u16,
    /// Parsed JSON body, `Null` when empty
    pub body: Value,
}

impl SyncResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport to the remote tree-sync service.
///
/// Non-success statuses are returned as responses, not errors; only failures
/// to talk to the server at all are `TransportError`s.
pub trait SyncTransport: Send + Sync {
    fn send(&self, request: SyncRequest) -> Result<SyncResponse, TransportError>;
}

/// Embedding index over metaprocess descriptions.
pub trait RecipeIndex: Send + Sync {
    fn add(&self, metaprocess: &Metaprocess) -> Result<(), TransportError>;

    /// Insert or refresh; re-embeds only when the description changed.
    fn update(&self, metaprocess: &Metaprocess) -> Result<(), TransportError>;

    /// Closest recipes to `description`, nearest first, with their distances.
    fn search(
        &self,
        description: &str,
        k: usize,
    ) -> Result<Vec<(Metaprocess, f32)>, TransportError>;
}

// ============================================================
// REAL IMPLEMENTATIONS
// ============================================================

/// Real filesystem implementation.
#[derive(Debug, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        std::fs::write(path, content)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    fn ensure_parent(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                self.create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}
