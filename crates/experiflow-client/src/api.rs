use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use experiflow_types::{ExperiflowError, Result, TransformSpec, Variant};

use crate::ExperimentSource;

// ---------------------------------------------------------------------------
// ApiClient
// ---------------------------------------------------------------------------

/// HTTP client for the ExperiFlow experiment service.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    edge_token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            edge_token: None,
        }
    }

    /// Bearer token sent with transform-spec requests. Empty tokens are ignored.
    pub fn with_edge_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.edge_token = (!token.is_empty()).then_some(token);
        self
    }

    /// Per-call ceiling independent of any caller deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExperiflowError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(self)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn variants_url(&self, experiment_id: &str) -> String {
        format!(
            "{}/behavior/experiments/{}/public/variants",
            self.base_url, experiment_id
        )
    }

    fn transform_spec_url(&self, experiment_id: &str) -> String {
        format!(
            "{}/v1/experiments/{}/transform-spec",
            self.base_url, experiment_id
        )
    }
}

// ---------------------------------------------------------------------------
// Response handling
// ---------------------------------------------------------------------------

async fn read_json<T: DeserializeOwned>(endpoint: &str, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body = resp.text().await.map_err(|e| ExperiflowError::Api {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        message: e.to_string(),
    })?;

    if status != reqwest::StatusCode::OK {
        return Err(map_error(endpoint, status, &body));
    }

    serde_json::from_str(&body).map_err(|e| ExperiflowError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

fn map_error(endpoint: &str, status: reqwest::StatusCode, body: &str) -> ExperiflowError {
    ExperiflowError::Api {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        message: extract_error_message(body),
    }
}

/// Prefer a JSON `detail`/`error`/`message` field; otherwise the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["detail", "error", "message"]
                .iter()
                .find_map(|key| v[*key].as_str().map(String::from))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn transport_error(endpoint: &str, e: reqwest::Error) -> ExperiflowError {
    ExperiflowError::Api {
        endpoint: endpoint.to_string(),
        status: 0,
        message: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// ExperimentSource implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ExperimentSource for ApiClient {
    async fn variants(&self, experiment_id: &str) -> Result<Vec<Variant>> {
        let url = self.variants_url(experiment_id);
        debug!(experiment = experiment_id, %url, "Fetching variants");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        read_json(&url, resp).await
    }

    async fn transform_spec(&self, experiment_id: &str, variant_id: &str) -> Result<TransformSpec> {
        let url = self.transform_spec_url(experiment_id);
        debug!(experiment = experiment_id, variant = variant_id, %url, "Fetching transform spec");

        let mut request = self
            .client
            .post(&url)
            .json(&json!({ "variant_id": variant_id }));
        if let Some(token) = &self.edge_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(|e| transport_error(&url, e))?;
        read_json(&url, resp).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
