//! Tool adapter that forwards invocations to an HTTP endpoint.
//!
//! POST {endpoint}            body: invocation args (JSON)  → result (JSON)
//! GET  {health_endpoint}     any 2xx counts as healthy

use async_trait::async_trait;

use super::{ToolAdapter, ToolError};
use crate::config::ToolEndpointConfig;

pub struct HttpToolAdapter {
    id: String,
    endpoint: String,
    health_endpoint: Option<String>,
    client: reqwest::Client,
}

impl HttpToolAdapter {
    pub fn new(id: &str, endpoint: &str, health_endpoint: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            health_endpoint: health_endpoint.map(|s| s.to_string()),
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn from_config(config: &ToolEndpointConfig) -> Self {
        Self::new(
            &config.id,
            &config.endpoint,
            config.health_endpoint.as_deref(),
        )
    }
}

#[async_trait]
impl ToolAdapter for HttpToolAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        tracing::debug!("[Tools] POST {} ({})", self.endpoint, self.id);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&args)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Failed(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(ToolError::Failed(format!("{} returned {}: {}", self.id, status, text)));
        }
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ToolError::Failed(format!("Failed to parse response JSON: {}", e)))
    }

    async fn health_check(&self) -> bool {
        let Some(url) = &self.health_endpoint else {
            return true;
        };
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!("[Tools] Health check of {} failed: {}", self.id, e);
                false
            }
        }
    }
}
