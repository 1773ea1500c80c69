//! Test setup and scripted collaborators.

use std::collections::{HashMap, VecDeque};
use std::env;
use std::sync::{Mutex, Once};

use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::{
    filter::filter_fn,
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

use crate::application::metaprocess::Metaprocess;
use crate::infrastructure::error::TransportError;
use crate::infrastructure::traits::{
    Completion, CompletionEngine, CompletionRequest, HttpMethod, RecipeIndex, SyncRequest,
    SyncResponse, SyncTransport, TokenLogprob,
};

static TEST_SETUP: Once = Once::new();

pub fn init_test_setup() {
    TEST_SETUP.call_once(|| {
        if env::var("RUST_LOG").is_err() {
            env::set_var("RUST_LOG", "trace");
        }
        // global logging subscriber, used by all tracing log macros
        setup_test_logging();
        info!("Test Setup complete");
    });
}

fn setup_test_logging() {
    debug!("INIT: Attempting logger init from testing.rs");

    // Create a filter for noisy modules
    let noisy_modules = ["rayon", "reqwest", "hyper"];
    let module_filter = filter_fn(move |metadata| {
        !noisy_modules
            .iter()
            .any(|name| metadata.target().starts_with(name))
    });

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let subscriber = tracing_subscriber::registry().with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_names(false)
            .with_span_events(FmtSpan::ENTER)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(module_filter)
            .with_filter(env_filter),
    );

    // Only set if we haven't already set a global subscriber
    if tracing::dispatcher::has_been_set() {
        debug!("Tracing subscriber already set");
    } else {
        subscriber.try_init().unwrap_or_else(|e| {
            eprintln!("Error: Failed to set up logging: {}", e);
        });
    }
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Completion engine answering from a script keyed by prompt.
///
/// Unscripted prompts get the default distribution, or none at all.
#[derive(Default)]
pub struct ScriptedEngine {
    distributions: HashMap<String, Result<Vec<TokenLogprob>, TransportError>>,
    default_distribution: Option<Vec<TokenLogprob>>,
    scores: HashMap<String, f64>,
    completions: HashMap<String, Completion>,
    default_completion: Option<Completion>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates as `(token, probability)`; stored as logprobs.
    pub fn with_distribution(mut self, prompt: &str, candidates: &[(&str, f64)]) -> Self {
        let logprobs = candidates
            .iter()
            .map(|(token, p)| TokenLogprob::new(*token, p.ln()))
            .collect();
        self.distributions.insert(prompt.to_string(), Ok(logprobs));
        self
    }

    pub fn with_failure(mut self, prompt: &str, error: TransportError) -> Self {
        self.distributions.insert(prompt.to_string(), Err(error));
        self
    }

    pub fn with_default(mut self, logprobs: Vec<TokenLogprob>) -> Self {
        self.default_distribution = Some(logprobs);
        self
    }

    pub fn with_score(mut self, token: &str, probability: f64) -> Self {
        self.scores.insert(token.to_string(), probability);
        self
    }

    pub fn with_completion(mut self, prompt: &str, completion: Completion) -> Self {
        self.completions.insert(prompt.to_string(), completion);
        self
    }

    pub fn with_default_completion(mut self, completion: Completion) -> Self {
        self.default_completion = Some(completion);
        self
    }

    /// Prompts seen so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }
}

impl CompletionEngine for ScriptedEngine {
    fn top_logprobs(
        &self,
        request: &CompletionRequest,
    ) -> Result<Vec<TokenLogprob>, TransportError> {
        locked(&self.calls).push(request.prompt.clone());
        match self.distributions.get(&request.prompt) {
            Some(scripted) => scripted.clone(),
            None => Ok(self.default_distribution.clone().unwrap_or_default()),
        }
    }

    fn score_token(
        &self,
        _prompt: &str,
        token: &str,
        _engine: &str,
    ) -> Result<Option<f64>, TransportError> {
        Ok(self.scores.get(token).copied())
    }

    fn generate(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        locked(&self.calls).push(request.prompt.clone());
        self.completions
            .get(&request.prompt)
            .or(self.default_completion.as_ref())
            .cloned()
            .ok_or_else(|| {
                TransportError::Request(format!("no completion for {:?}", request.prompt))
            })
    }
}

/// Sync transport that records requests and replays queued responses.
///
/// Unqueued routes answer `200` with a `null` body.
#[derive(Default)]
pub struct RecordingTransport {
    responses: Mutex<HashMap<(HttpMethod, String), VecDeque<SyncResponse>>>,
    requests: Mutex<Vec<SyncRequest>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, method: HttpMethod, path: &str, status: u16, body: Value) -> Self {
        locked(&self.responses)
            .entry((method, path.to_string()))
            .or_default()
            .push_back(SyncResponse { status, body });
        self
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        locked(&self.requests).clone()
    }
}

impl SyncTransport for RecordingTransport {
    fn send(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        let key = (request.method, request.path.clone());
        locked(&self.requests).push(request);
        Ok(locked(&self.responses)
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(SyncResponse {
                status: 200,
                body: Value::Null,
            }))
    }
}

/// Recipe index that only remembers what it was told.
#[derive(Default)]
pub struct RecordingRecipeIndex {
    entries: Mutex<Vec<Metaprocess>>,
}

impl RecordingRecipeIndex {
    pub fn ids(&self) -> Vec<String> {
        locked(&self.entries)
            .iter()
            .filter_map(|m| m.id.clone())
            .collect()
    }
}

impl RecipeIndex for RecordingRecipeIndex {
    fn add(&self, metaprocess: &Metaprocess) -> Result<(), TransportError> {
        locked(&self.entries).push(metaprocess.clone());
        Ok(())
    }

    fn update(&self, metaprocess: &Metaprocess) -> Result<(), TransportError> {
        let mut entries = locked(&self.entries);
        match entries.iter_mut().find(|m| m.id == metaprocess.id) {
            Some(existing) => *existing = metaprocess.clone(),
            None => entries.push(metaprocess.clone()),
        }
        Ok(())
    }

    fn search(
        &self,
        description: &str,
        k: usize,
    ) -> Result<Vec<(Metaprocess, f32)>, TransportError> {
        let needle = description.to_lowercase();
        Ok(locked(&self.entries)
            .iter()
            .filter(|m| m.description.to_lowercase().contains(&needle))
            .take(k)
            .map(|m| (m.clone(), 0.0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_setup() {
        init_test_setup();
    }

    #[test]
    fn given_queued_responses_when_sending_then_replayed_in_order() {
        let transport = RecordingTransport::new()
            .respond(HttpMethod::Get, "/nodes/count", 200, Value::from(3))
            .respond(HttpMethod::Get, "/nodes/count", 500, Value::Null);
        let request = SyncRequest {
            method: HttpMethod::Get,
            path: "/nodes/count".into(),
            headers: vec![],
            body: None,
        };
        assert_eq!(transport.send(request.clone()).unwrap().body, Value::from(3));
        assert_eq!(transport.send(request.clone()).unwrap().status, 500);
        assert_eq!(transport.send(request).unwrap().status, 200);
        assert_eq!(transport.requests().len(), 3);
    }
}
