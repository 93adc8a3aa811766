//! Forwarding of JSON calls to ready plugins and reading of the
//! capabilities they advertise.

use std::time::Duration;

use reqwest::RequestBuilder;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::credentials::Secret;
use crate::error::PluginError;
use crate::registry::Endpoint;
use crate::runtime::PLUGIN_HOST;

const GATEWAY_TARGET: &str = "spindle_plugins::gateway";

/// Characters of a rejected response body kept in the error.
pub const REJECTED_BODY_LIMIT: usize = 1024;

/// What a plugin offers beyond its call endpoint.
///
/// Entries are kept as the plugin describes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginCapabilities {
    /// Callable tools.
    pub tools: Vec<Value>,
    /// Readable resources.
    pub resources: Vec<Value>,
    /// Prompt templates.
    pub prompts: Vec<Value>,
}

/// HTTP client for loopback plugin traffic.
///
/// Plugins listen on the loopback interface, so proxy settings from the
/// environment are ignored.
pub(crate) fn loopback_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// HTTP client for plugin call endpoints.
#[derive(Debug, Clone)]
pub struct CallGateway {
    client: reqwest::Client,
    timeout: Duration,
}

impl CallGateway {
    /// Creates a gateway that bounds every call by `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: loopback_client(),
            timeout,
        }
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// URL of the call endpoint.
    #[must_use]
    pub fn url(endpoint: &Endpoint) -> String {
        format!(
            "http://{PLUGIN_HOST}:{}{}",
            endpoint.port, endpoint.call_path
        )
    }

    /// URL of the capabilities listing.
    #[must_use]
    pub fn capabilities_url(endpoint: &Endpoint) -> String {
        format!(
            "http://{PLUGIN_HOST}:{}{}",
            endpoint.port, endpoint.capabilities_path
        )
    }

    /// POSTs `payload` to the plugin and returns its JSON reply.
    ///
    /// An empty success body yields `Value::Null`.
    ///
    /// # Errors
    ///
    /// - [`PluginError::CallTimeout`] when the timeout elapses.
    /// - [`PluginError::CallTransportError`] when the endpoint cannot be
    ///   reached or drops the connection.
    /// - [`PluginError::CallRejected`] for a non-2xx status.
    /// - [`PluginError::InvalidResponse`] when the body is not JSON.
    pub async fn forward(
        &self,
        endpoint: &Endpoint,
        payload: &Value,
        authorization: Option<&Secret>,
    ) -> Result<Value, PluginError> {
        let url = Self::url(endpoint);
        debug!(
            target: GATEWAY_TARGET,
            plugin = endpoint.name.as_str(),
            url = url.as_str(),
            "forwarding call"
        );
        let request = self.client.post(&url).json(payload);
        self.exchange(endpoint, request, authorization).await
    }

    /// GETs the plugin's capabilities listing.
    ///
    /// Missing lists read as empty, and so does an empty success body.
    ///
    /// # Errors
    ///
    /// As [`Self::forward`]; a body that is JSON but not a capabilities
    /// object is a [`PluginError::InvalidResponse`].
    pub async fn capabilities(
        &self,
        endpoint: &Endpoint,
        authorization: Option<&Secret>,
    ) -> Result<PluginCapabilities, PluginError> {
        let url = Self::capabilities_url(endpoint);
        debug!(
            target: GATEWAY_TARGET,
            plugin = endpoint.name.as_str(),
            url = url.as_str(),
            "reading capabilities"
        );
        let request = self.client.get(&url);
        match self.exchange(endpoint, request, authorization).await? {
            Value::Null => Ok(PluginCapabilities::default()),
            listing => {
                serde_json::from_value(listing).map_err(|error| PluginError::InvalidResponse {
                    name: endpoint.name.clone(),
                    message: error.to_string(),
                })
            }
        }
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: RequestBuilder,
        authorization: Option<&Secret>,
    ) -> Result<Value, PluginError> {
        let mut request = request.timeout(self.timeout);
        if let Some(secret) = authorization {
            let mut value = HeaderValue::from_str(secret.expose()).map_err(|_| {
                PluginError::CallTransportError {
                    name: endpoint.name.clone(),
                    message: "credential is not a valid header value".to_owned(),
                }
            })?;
            value.set_sensitive(true);
            request = request.header(AUTHORIZATION, value);
        }

        let response = request
            .send()
            .await
            .map_err(|error| self.transport_error(endpoint, &error))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|error| self.transport_error(endpoint, &error))?;

        if !status.is_success() {
            return Err(PluginError::CallRejected {
                name: endpoint.name.clone(),
                status: status.as_u16(),
                body: truncate(&String::from_utf8_lossy(&body)),
            });
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|error| PluginError::InvalidResponse {
            name: endpoint.name.clone(),
            message: error.to_string(),
        })
    }

    fn transport_error(&self, endpoint: &Endpoint, error: &reqwest::Error) -> PluginError {
        if error.is_timeout() {
            PluginError::CallTimeout {
                name: endpoint.name.clone(),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else {
            PluginError::CallTransportError {
                name: endpoint.name.clone(),
                message: error.to_string(),
            }
        }
    }
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= REJECTED_BODY_LIMIT {
        return body.to_owned();
    }
    let mut kept: String = body.chars().take(REJECTED_BODY_LIMIT).collect();
    kept.push_str("...");
    kept
}
