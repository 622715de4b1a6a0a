//! Webhook provider.
//!
//! Posts each operation as JSON to an HTTP endpoint that owns the actual
//! side effects, and maps HTTP status codes onto provider errors.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ConvergeError, ProviderError, Result};
use crate::planner::{Operation, OperationType};
use crate::resource::ResourceRef;
use crate::state::{ObservedAttributes, ObservedResource};

use super::Provider;

/// Environment variable holding the bearer token sent to the endpoint.
pub const PROVIDER_TOKEN_ENV: &str = "CONVERGE_PROVIDER_TOKEN";

/// Provider backed by a webhook endpoint.
///
/// `POST {endpoint}/apply` receives one operation; `POST {endpoint}/observe`
/// receives one recorded resource and answers 404 once it is gone.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Endpoint base URL, without trailing slash.
    endpoint: String,
    /// Optional bearer token.
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApplyRequest<'a> {
    operation: OperationType,
    kind: &'a str,
    name: &'a str,
    attributes: &'a ObservedAttributes,
    depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    desired_hash: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ObserveRequest<'a> {
    kind: &'a str,
    name: &'a str,
    attributes: &'a ObservedAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct AttributesResponse {
    #[serde(default)]
    attributes: ObservedAttributes,
}

impl HttpProvider {
    /// Creates a provider for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ConvergeError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Creates a provider, reading the bearer token from
    /// `CONVERGE_PROVIDER_TOKEN` if set.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_env(endpoint: &str, timeout_secs: u64) -> Result<Self> {
        let provider = Self::new(endpoint, timeout_secs)?;
        Ok(match std::env::var(PROVIDER_TOKEN_ENV) {
            Ok(token) if !token.is_empty() => provider.with_token(token),
            _ => provider,
        })
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    async fn post<B: Serialize + Sync>(
        &self,
        resource: &ResourceRef,
        route: &str,
        body: &B,
    ) -> std::result::Result<reqwest::Response, ProviderError> {
        let url = format!("{}/{route}", self.endpoint);
        trace!("POST {url} for {resource}");

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        request
            .send()
            .await
            .map_err(|e| ProviderError::transient(resource.clone(), format!("Request failed: {e}")))
    }

    /// Reads the attributes a success response reports; `None` for an empty
    /// body.
    async fn read_attributes(
        resource: &ResourceRef,
        response: reqwest::Response,
    ) -> std::result::Result<Option<ObservedAttributes>, ProviderError> {
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::transient(resource.clone(), format!("Failed to read response: {e}")))?;

        if body.trim().is_empty() {
            return Ok(None);
        }

        let parsed: AttributesResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::rejected(resource.clone(), format!("Invalid response body: {e}"))
        })?;
        Ok(Some(parsed.attributes))
    }
}

/// Maps a non-success status onto a provider error.
fn status_error(resource: &ResourceRef, status: StatusCode, body: &str) -> ProviderError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound {
            resource: resource.clone(),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::transient(resource.clone(), message)
        }
        s if s.is_server_error() => ProviderError::transient(resource.clone(), message),
        _ => ProviderError::rejected(resource.clone(), message),
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn apply(&self, operation: &Operation) -> std::result::Result<ObservedAttributes, ProviderError> {
        let resource = operation.id();
        let body = ApplyRequest {
            operation: operation.op_type,
            kind: &operation.resource.kind,
            name: &operation.resource.name,
            attributes: &operation.resource.attributes,
            depends_on: operation.resource.depends_on.iter().map(ToString::to_string).collect(),
            desired_hash: operation.desired_hash.as_deref(),
        };

        let response = self.post(&resource, "apply", &body).await?;
        let status = response.status();
        debug!("{} {resource}: HTTP {status}", operation.op_type);

        if status.is_success() {
            let reported = Self::read_attributes(&resource, response).await?;
            return Ok(reported.unwrap_or_default());
        }

        let text = response.text().await.unwrap_or_default();
        Err(status_error(&resource, status, &text))
    }

    async fn observe(
        &self,
        observed: &ObservedResource,
    ) -> std::result::Result<Option<ObservedAttributes>, ProviderError> {
        let resource = observed.id();
        let body = ObserveRequest {
            kind: &observed.kind,
            name: &observed.name,
            attributes: &observed.attributes,
        };

        let response = self.post(&resource, "observe", &body).await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        // An empty answer means the endpoint has nothing new to say.
        if status.is_success() {
            let reported = Self::read_attributes(&resource, response).await?;
            return Ok(Some(reported.unwrap_or_else(|| observed.attributes.clone())));
        }

        let text = response.text().await.unwrap_or_default();
        Err(status_error(&resource, status, &text))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
