//! Blocking HTTP transport for the tree-sync server.

use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;
use tracing::trace;

use crate::infrastructure::error::TransportError;
use crate::infrastructure::traits::{HttpMethod, SyncRequest, SyncResponse, SyncTransport};

pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl SyncTransport for HttpTransport {
    fn send(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        let url = self.url(&request.path);
        trace!("{} {}", request.method, url);
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send()?;
        let status = response.status().as_u16();
        let text = response.text()?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            // non-JSON bodies are kept as plain strings
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(SyncResponse { status, body })
    }
}
