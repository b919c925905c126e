//! Game publisher credit APIs.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{PublisherConfig, PublisherEndpoint, PublisherMode};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    pub order_id: String,
    pub game_id: String,
    pub denom_code: String,
    pub player_id: String,
    pub server_id: Option<String>,
    pub attempt: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    #[serde(default)]
    pub reference: String,
}

/// Publisher failures split by whether a later attempt can succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublisherError {
    #[error("transient publisher failure: {0}")]
    Transient(String),

    #[error("publisher rejected top-up: {0}")]
    Permanent(String),
}

impl PublisherError {
    /// 408, 429 and 5xx can be retried; other error statuses are final.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            PublisherError::Transient(detail)
        } else {
            PublisherError::Permanent(detail)
        }
    }
}

#[async_trait]
pub trait PublisherClient: Send + Sync {
    /// Credits the player. Publishers dedupe on the order id, so repeating a
    /// delivery never double-credits.
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, PublisherError>;

    fn name(&self) -> &str;
}

/// JSON REST publisher: `POST {base}/v1/topups`.
pub struct HttpPublisherClient {
    client: Client,
    name: String,
    endpoint: PublisherEndpoint,
}

impl HttpPublisherClient {
    pub fn new(
        name: impl Into<String>,
        endpoint: PublisherEndpoint,
        timeout: Duration,
    ) -> Result<Self, PublisherError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PublisherError::Permanent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            name: name.into(),
            endpoint,
        })
    }
}

#[async_trait]
impl PublisherClient for HttpPublisherClient {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, PublisherError> {
        let url = format!("{}/v1/topups", self.endpoint.base_url);
        debug!(publisher = %self.name, order_id = %request.order_id, "delivering top-up");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.endpoint.api_key)
            .header("Idempotency-Key", &request.order_id)
            .json(request)
            .send()
            .await
            .map_err(|e| PublisherError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(PublisherError::from_status(status, &body));
        }

        // The credit went through; an unreadable receipt must not trigger a retry.
        Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
            warn!(publisher = %self.name, order_id = %request.order_id, error = %e, "unreadable publisher receipt");
            DeliveryReceipt {
                reference: String::new(),
            }
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Accepts every delivery. Used for local runs.
#[derive(Debug, Default)]
pub struct SandboxPublisher;

#[async_trait]
impl PublisherClient for SandboxPublisher {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, PublisherError> {
        Ok(DeliveryReceipt {
            reference: format!("sbx_{}", request.order_id),
        })
    }

    fn name(&self) -> &str {
        "sandbox"
    }
}

/// Routes a game's publisher name to its client.
#[derive(Default, Clone)]
pub struct PublisherRegistry {
    clients: HashMap<String, Arc<dyn PublisherClient>>,
    fallback: Option<Arc<dyn PublisherClient>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publisher resolves to `client`.
    pub fn single(client: Arc<dyn PublisherClient>) -> Self {
        Self {
            clients: HashMap::new(),
            fallback: Some(client),
        }
    }

    pub fn with_client(mut self, publisher: &str, client: Arc<dyn PublisherClient>) -> Self {
        self.clients.insert(publisher.to_lowercase(), client);
        self
    }

    pub fn resolve(&self, publisher: &str) -> Option<Arc<dyn PublisherClient>> {
        self.clients
            .get(&publisher.to_lowercase())
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    pub fn from_config(config: &PublisherConfig) -> Result<Self, PublisherError> {
        match config.mode {
            PublisherMode::Sandbox => Ok(Self::single(Arc::new(SandboxPublisher))),
            PublisherMode::Http => {
                let timeout = Duration::from_secs(config.timeout_secs);
                let mut registry = Self::new();
                for (name, endpoint) in &config.endpoints {
                    let client = HttpPublisherClient::new(name.clone(), endpoint.clone(), timeout)?;
                    registry = registry.with_client(name, Arc::new(client));
                }
                Ok(registry)
            }
        }
    }
}
