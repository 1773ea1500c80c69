//! Completion engine over an OpenAI-style `/completions` endpoint.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::config::ModelSettings;
use crate::infrastructure::error::TransportError;
use crate::infrastructure::traits::{
    Completion, CompletionEngine, CompletionRequest, TokenLogprob,
};

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    text: String,
    #[serde(default)]
    logprobs: Option<Logprobs>,
}

#[derive(Debug, Default, Deserialize)]
struct Logprobs {
    #[serde(default)]
    tokens: Vec<String>,
    #[serde(default)]
    token_logprobs: Vec<Option<f64>>,
    /// Character offset of each token in the echoed text.
    #[serde(default)]
    text_offset: Vec<usize>,
    #[serde(default)]
    top_logprobs: Vec<Option<HashMap<String, f64>>>,
}

impl Logprobs {
    /// Alternatives for the first generated token, best first.
    fn first_ranked(&self) -> Vec<TokenLogprob> {
        let mut ranked: Vec<TokenLogprob> = self
            .top_logprobs
            .first()
            .and_then(Option::as_ref)
            .map(|alternatives| {
                alternatives
                    .iter()
                    .map(|(token, lp)| TokenLogprob::new(token.clone(), *lp))
                    .collect()
            })
            .unwrap_or_default();
        ranked.sort_by(|a, b| {
            b.logprob
                .total_cmp(&a.logprob)
                .then_with(|| a.token.cmp(&b.token))
        });
        ranked
    }

    /// Joint logprob of the echoed tokens starting at character `offset`.
    ///
    /// A continuation may span several model tokens; their logprobs are summed.
    /// Offsets are derived from the token texts when the response omits them.
    /// `None` if no token starts at or past `offset` or one of them is unscored.
    fn continuation_logprob(&self, offset: usize) -> Option<f64> {
        let offsets: Vec<usize> = if self.text_offset.len() == self.token_logprobs.len() {
            self.text_offset.clone()
        } else if self.tokens.len() == self.token_logprobs.len() {
            self.tokens
                .iter()
                .scan(0, |position, token| {
                    let start = *position;
                    *position += token.chars().count();
                    Some(start)
                })
                .collect()
        } else {
            return None;
        };
        let mut continuation = offsets
            .iter()
            .zip(&self.token_logprobs)
            .filter(|(start, _)| **start >= offset)
            .map(|(_, lp)| *lp)
            .peekable();
        continuation.peek()?;
        continuation.sum()
    }
}

pub struct OpenAiEngine {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_key_env: String,
}

impl OpenAiEngine {
    pub fn new(settings: &ModelSettings) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&settings.api_key_env).ok(),
            api_key_env: settings.api_key_env.clone(),
        })
    }

    fn post(&self, body: Value) -> Result<CompletionResponse, TransportError> {
        let key = self.api_key.as_deref().ok_or_else(|| {
            TransportError::Request(format!("API key variable {} is not set", self.api_key_env))
        })?;
        let url = format!("{}/completions", self.base_url);
        debug!("POST {}", url);
        let response = self.client.post(&url).bearer_auth(key).json(&body).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        response
            .json::<CompletionResponse>()
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    fn body(request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": request.engine,
            "prompt": request.prompt,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "n": request.n,
        });
        if request.top_logprobs > 0 {
            body["logprobs"] = json!(request.top_logprobs);
        }
        if let Some(stop) = &request.stop {
            body["stop"] = json!(stop);
        }
        body
    }
}

impl CompletionEngine for OpenAiEngine {
    #[instrument(level = "trace", skip(self, request), fields(engine = %request.engine))]
    fn top_logprobs(
        &self,
        request: &CompletionRequest,
    ) -> Result<Vec<TokenLogprob>, TransportError> {
        let response = self.post(Self::body(request))?;
        let choice = response
            .choices
            .first()
            .ok_or_else(|| TransportError::Decode("no choices in response".into()))?;
        let logprobs = choice
            .logprobs
            .as_ref()
            .ok_or_else(|| TransportError::Decode("response carries no logprobs".into()))?;
        Ok(logprobs.first_ranked())
    }

    /// Scores `token` by echoing `prompt + token` and summing the logprobs of
    /// every model token past the prompt.
    fn score_token(
        &self,
        prompt: &str,
        token: &str,
        engine: &str,
    ) -> Result<Option<f64>, TransportError> {
        let body = json!({
            "model": engine,
            "prompt": format!("{prompt}{token}"),
            "max_tokens": 0,
            "echo": true,
            "logprobs": 0,
        });
        let response = self.post(body)?;
        let logprob = response
            .choices
            .first()
            .and_then(|c| c.logprobs.as_ref())
            .and_then(|lp| lp.continuation_logprob(prompt.chars().count()));
        Ok(logprob.map(f64::exp))
    }

    fn generate(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        let response = self.post(Self::body(request))?;
        let first_token_logprobs = response
            .choices
            .first()
            .and_then(|c| c.logprobs.as_ref())
            .map(Logprobs::first_ranked)
            .unwrap_or_default();
        Ok(Completion {
            texts: response.choices.into_iter().map(|c| c.text).collect(),
            first_token_logprobs,
        })
    }
}
