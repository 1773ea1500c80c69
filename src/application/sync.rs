//! Client for the remote tree-sync service.
//!
//! Every request carries the shared secret in `Authorization` and the remote
//! tree in `X-Tree-Id`. Updates are upserts: a node unknown to the server is
//! created instead.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::application::{ApplicationError, ApplicationResult};
use crate::domain::{FlatNode, LoomTree, NodeId, NodeMeta, TIMESTAMP_FORMAT};
use crate::infrastructure::error::TransportError;
use crate::infrastructure::traits::{HttpMethod, SyncRequest, SyncResponse, SyncTransport};

/// Timestamp format used on the wire.
pub const REMOTE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Node as the sync server stores it.
///
/// Attributes and a cleared `mutable` flag travel as extra fields so a push
/// followed by a pull keeps them; servers that drop unknown fields lose them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    pub id: NodeId,
    #[serde(rename = "parentId", default)]
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub mutable: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

impl RemoteNode {
    /// Remote form of `node`; the timestamp falls back to now.
    pub fn from_flat(node: &FlatNode, author: Option<&str>) -> Self {
        let timestamp = node
            .meta
            .creation_timestamp
            .as_deref()
            .and_then(|raw| NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).ok())
            .map(|ts| ts.format(REMOTE_TIMESTAMP_FORMAT).to_string())
            .unwrap_or_else(|| Local::now().format(REMOTE_TIMESTAMP_FORMAT).to_string());
        Self {
            id: node.id.clone(),
            parent_id: node.parent_id.clone(),
            text: node.text.clone(),
            children: node.children.clone(),
            author: author.map(str::to_string),
            timestamp: Some(timestamp),
            mutable: node.mutable,
            attributes: node.attributes.clone(),
        }
    }

    pub fn into_flat(self) -> FlatNode {
        let creation_timestamp = self
            .timestamp
            .as_deref()
            .and_then(|raw| NaiveDateTime::parse_from_str(raw, REMOTE_TIMESTAMP_FORMAT).ok())
            .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string());
        FlatNode {
            id: self.id,
            text: self.text,
            parent_id: self.parent_id,
            children: self.children,
            mutable: self.mutable,
            meta: NodeMeta { creation_timestamp },
            attributes: self.attributes,
        }
    }
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
}

pub struct SyncClient {
    transport: Arc<dyn SyncTransport>,
    tree_id: String,
    token: String,
    author: Option<String>,
}

impl SyncClient {
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        tree_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            tree_id: tree_id.into(),
            token: token.into(),
            author: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn tree_id(&self) -> &str {
        &self.tree_id
    }

    fn send(
        &self,
        method: HttpMethod,
        path: String,
        body: Option<Value>,
    ) -> ApplicationResult<SyncResponse> {
        let request = SyncRequest {
            method,
            path: path.clone(),
            headers: vec![
                ("Authorization".into(), self.token.clone()),
                ("X-Tree-Id".into(), self.tree_id.clone()),
            ],
            body,
        };
        debug!("{} {}", method, path);
        self.transport
            .send(request)
            .map_err(|e| transport_err(method, &path, e))
    }

    fn expect_success(
        &self,
        method: HttpMethod,
        path: String,
        body: Option<Value>,
    ) -> ApplicationResult<Value> {
        let response = self.send(method, path.clone(), body)?;
        if !response.is_success() {
            return Err(status_err(method, &path, &response));
        }
        Ok(response.body)
    }

    fn remote(&self, node: &FlatNode) -> Value {
        json!(RemoteNode::from_flat(node, self.author.as_deref()))
    }

    /// `None` when the server does not know the node.
    pub fn get_node(&self, id: &NodeId) -> ApplicationResult<Option<RemoteNode>> {
        let path = format!("/nodes/{id}");
        let response = self.send(HttpMethod::Get, path.clone(), None)?;
        match response.status {
            404 => Ok(None),
            _ if response.is_success() => decode(&path, response.body).map(Some),
            _ => Err(status_err(HttpMethod::Get, &path, &response)),
        }
    }

    pub fn post_node(&self, node: &FlatNode) -> ApplicationResult<()> {
        self.expect_success(HttpMethod::Post, "/nodes".into(), Some(self.remote(node)))?;
        Ok(())
    }

    pub fn post_nodes(&self, nodes: &[FlatNode]) -> ApplicationResult<()> {
        let body = Value::Array(nodes.iter().map(|n| self.remote(n)).collect());
        self.expect_success(HttpMethod::Post, "/nodes/batch".into(), Some(body))?;
        Ok(())
    }

    /// PUT the node; a 404 creates it instead.
    #[instrument(level = "debug", skip(self, node), fields(node = %node.id))]
    pub fn update_node(&self, node: &FlatNode) -> ApplicationResult<Upsert> {
        let path = format!("/nodes/{}", node.id);
        let response = self.send(HttpMethod::Put, path.clone(), Some(self.remote(node)))?;
        match response.status {
            404 => {
                debug!("node unknown remotely, creating");
                self.post_node(node)?;
                Ok(Upsert::Created)
            }
            _ if response.is_success() => Ok(Upsert::Updated),
            _ => Err(status_err(HttpMethod::Put, &path, &response)),
        }
    }

    /// Batch upsert: existing nodes are PUT, the rest POSTed.
    #[instrument(level = "debug", skip(self, nodes), fields(count = nodes.len()))]
    pub fn update_nodes(&self, nodes: &[FlatNode]) -> ApplicationResult<(usize, usize)> {
        if nodes.is_empty() {
            return Ok((0, 0));
        }
        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        let existing = self.exists_batch(&ids)?;
        let (known, unknown): (Vec<FlatNode>, Vec<FlatNode>) = nodes
            .iter()
            .cloned()
            .partition(|n| existing.get(&n.id).copied().unwrap_or(false));
        if !known.is_empty() {
            let body = Value::Array(known.iter().map(|n| self.remote(n)).collect());
            self.expect_success(HttpMethod::Put, "/nodes/batch".into(), Some(body))?;
        }
        if !unknown.is_empty() {
            self.post_nodes(&unknown)?;
        }
        Ok((unknown.len(), known.len()))
    }

    pub fn delete_node(&self, id: &NodeId) -> ApplicationResult<()> {
        self.expect_success(HttpMethod::Delete, format!("/nodes/{id}"), None)?;
        Ok(())
    }

    pub fn delete_nodes(&self, ids: &[NodeId]) -> ApplicationResult<()> {
        let body = json!({ "ids": ids });
        self.expect_success(HttpMethod::Delete, "/nodes/batch".into(), Some(body))?;
        Ok(())
    }

    pub fn count(&self) -> ApplicationResult<u64> {
        let path = "/nodes/count".to_string();
        let body = self.expect_success(HttpMethod::Get, path.clone(), None)?;
        body.as_u64()
            .or_else(|| body.get("count").and_then(Value::as_u64))
            .ok_or_else(|| decode_err(&path, "expected a node count"))
    }

    /// All nodes, or those changed after `since`.
    pub fn get_nodes(&self, since: Option<&str>) -> ApplicationResult<Vec<RemoteNode>> {
        let path = match since {
            Some(ts) => format!("/nodes/get/{ts}"),
            None => "/nodes".to_string(),
        };
        let body = self.expect_success(HttpMethod::Get, path.clone(), None)?;
        decode(&path, body)
    }

    pub fn root(&self) -> ApplicationResult<RemoteNode> {
        let path = "/nodes/root".to_string();
        let body = self.expect_success(HttpMethod::Get, path.clone(), None)?;
        decode(&path, body)
    }

    pub fn history(&self, since: Option<&str>) -> ApplicationResult<Value> {
        let path = match since {
            Some(ts) => format!("/history/{ts}"),
            None => "/history".to_string(),
        };
        self.expect_success(HttpMethod::Get, path, None)
    }

    pub fn exists(&self, id: &NodeId) -> ApplicationResult<bool> {
        let path = format!("/nodes/exists/{id}");
        let body = self.expect_success(HttpMethod::Get, path.clone(), None)?;
        body.as_bool()
            .or_else(|| body.get("exists").and_then(Value::as_bool))
            .ok_or_else(|| decode_err(&path, "expected a boolean"))
    }

    /// Existence per id; the server may answer with a map or an aligned array.
    pub fn exists_batch(&self, ids: &[NodeId]) -> ApplicationResult<HashMap<NodeId, bool>> {
        let path = "/nodes/exists".to_string();
        let request = json!({ "ids": ids });
        let body = self.expect_success(HttpMethod::Post, path.clone(), Some(request))?;
        match body {
            Value::Object(map) => Ok(ids
                .iter()
                .map(|id| {
                    let flag = map.get(id.as_str()).and_then(Value::as_bool);
                    (id.clone(), flag.unwrap_or(false))
                })
                .collect()),
            Value::Array(flags) if flags.len() == ids.len() => ids
                .iter()
                .zip(flags)
                .map(|(id, flag)| {
                    flag.as_bool()
                        .map(|b| (id.clone(), b))
                        .ok_or_else(|| decode_err(&path, "expected booleans"))
                })
                .collect(),
            _ => Err(decode_err(&path, "expected a map or an array aligned with the ids")),
        }
    }

    /// Upsert every node of the tree.
    #[instrument(level = "debug", skip(self, tree))]
    pub fn push_tree(&self, tree: &LoomTree) -> ApplicationResult<(usize, usize)> {
        let Some(root) = tree.root() else {
            return Ok((0, 0));
        };
        let nodes = tree.to_flat(root)?;
        let (created, updated) = self.update_nodes(&nodes)?;
        info!("pushed {} nodes ({} created, {} updated)", nodes.len(), created, updated);
        Ok((created, updated))
    }

    /// Fetch every node and rebuild a validated tree.
    #[instrument(level = "debug", skip(self))]
    pub fn pull_tree(&self) -> ApplicationResult<LoomTree> {
        let nodes = self.get_nodes(None)?;
        info!("pulled {} nodes", nodes.len());
        let tree = LoomTree::from_flat(nodes.into_iter().map(RemoteNode::into_flat).collect())?;
        Ok(tree)
    }
}

fn transport_err(method: HttpMethod, path: &str, e: TransportError) -> ApplicationError {
    ApplicationError::OperationFailed {
        context: format!("{method} {path}"),
        source: Box::new(e),
    }
}

fn status_err(method: HttpMethod, path: &str, response: &SyncResponse) -> ApplicationError {
    ApplicationError::Sync {
        status: response.status,
        message: format!("{method} {path}: {}", response.body),
    }
}

fn decode_err(path: &str, message: &str) -> ApplicationError {
    transport_err(
        HttpMethod::Get,
        path,
        TransportError::Decode(message.to_string()),
    )
}

fn decode<T: serde::de::DeserializeOwned>(path: &str, body: Value) -> ApplicationResult<T> {
    serde_json::from_value(body).map_err(|e| decode_err(path, &e.to_string()))
}
