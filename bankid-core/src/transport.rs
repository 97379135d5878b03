//! Transport used by [`crate::BankIdClient`] to reach the RP API.
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{config::Config, error::BankIdError, http_request::Request, types::Method};

/// Sends one JSON request to an RP API method and returns the JSON response.
///
/// Implementations must not retry. A non-2xx response is returned as the
/// matching [`BankIdError`] so callers can tell a conflict
/// ([`BankIdError::AlreadyInProgress`]) from other failures.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Calls `method` with `params` as the JSON body.
    ///
    /// # Errors
    /// Returns the transport or API error for the call.
    async fn call(&self, method: Method, params: Value) -> Result<Value, BankIdError>;
}

/// Mutual TLS HTTPS transport to the RP API.
pub struct HttpTransport {
    base_url: String,
    request: Request,
}

impl HttpTransport {
    /// Creates a transport for `config`, loading the client certificate and CA bundle.
    ///
    /// # Errors
    /// Returns [`BankIdError::InvalidInput`] for an invalid configuration and
    /// [`BankIdError::Certificate`] when the TLS material cannot be used.
    pub fn new(config: &Config) -> Result<Self, BankIdError> {
        config.validate()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request: Request::new(config)?,
        })
    }

    /// Create a transport with a custom base URL and no client certificate (for testing).
    #[cfg(test)]
    #[must_use]
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            request: Request::insecure(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, method: Method, params: Value) -> Result<Value, BankIdError> {
        let url = format!("{}/{method}", self.base_url);
        debug!(%method, "calling BankID");

        let request_builder = self
            .request
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&params);
        let response = self.request.handle(request_builder).await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(BankIdError::from_response(url, status.as_u16(), &error_body));
        }

        let body = response
            .text()
            .await
            .map_err(|err| BankIdError::NetworkError {
                url: url.clone(),
                status: Some(status.as_u16()),
                error: format!("failed to read response body: {err}"),
            })?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(|err| BankIdError::SerializationError {
            error: format!("Failed to parse {method} response from {url}: {err}"),
        })
    }
}
