use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{EnforcerError, Result};

/// Read-only access to node objects on the orchestrator API server.
///
/// This is the only orchestrator surface the enforcer touches, and only on
/// demand: a node is fetched once, when first referenced.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Fetch a node object by name
    async fn get_node(&self, name: &str) -> Result<Node>;
}

/// HTTP client for the orchestrator API server
pub struct HttpNodeApi {
    base_url: String,
    client: Client,
}

impl HttpNodeApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl NodeApi for HttpNodeApi {
    /// GET /api/v1/nodes/{name}
    async fn get_node(&self, name: &str) -> Result<Node> {
        let url = format!("{}/api/v1/nodes/{}", self.base_url, name);
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EnforcerError::api_error(format!("HTTP request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EnforcerError::api_error(format!(
                "GET node failed with status {}: {}",
                status, body
            )));
        }

        resp.json::<Node>()
            .await
            .map_err(|e| EnforcerError::api_error(format!("Failed to parse node: {}", e)))
    }
}

/// In-memory `NodeApi` over a fixed set of node objects, for tests and
/// development outside a cluster
#[derive(Default)]
pub struct StaticNodeApi {
    nodes: Mutex<HashMap<String, Node>>,
}

impl StaticNodeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node under its metadata name
    pub fn insert(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes.lock().unwrap().insert(name, node);
    }
}

#[async_trait]
impl NodeApi for StaticNodeApi {
    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| EnforcerError::api_error(format!("node {} not found", name)))
    }
}
