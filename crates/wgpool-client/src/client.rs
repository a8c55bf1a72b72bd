//! HTTP client for the key pool server
//!
//! Every endpoint answers with a JSON envelope `{ "success": bool, "error": ..., ... }`.
//! A `success: false` envelope is reported as [`PoolError::Rejected`] even when
//! the HTTP status is 200.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use wgpool_proto::{Lease, PoolStatus};

use crate::pool::{KeyPool, PoolError, ReleaseOutcome};

/// Default pool server base URL
pub const DEFAULT_POOL_URL: &str = "http://127.0.0.1:3000/vpn_api";

/// Pool client configuration
#[derive(Debug, Clone)]
pub struct PoolClientConfig {
    /// Base URL, endpoint paths are appended to it
    pub base_url: String,
    /// Timeout for each request
    pub timeout: Duration,
}

impl Default for PoolClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_POOL_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Key pool HTTP client
#[derive(Debug, Clone)]
pub struct KeyPoolClient {
    http: reqwest::Client,
    base_url: String,
}

/// `/list` answers either with an envelope or with a bare array
#[derive(Deserialize)]
#[serde(untagged)]
enum ServerList {
    Envelope {
        #[serde(default)]
        servers: Vec<String>,
    },
    Bare(Vec<String>),
}

impl KeyPoolClient {
    /// Create a new pool client
    pub fn new(config: PoolClientConfig) -> Result<Self, PoolError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PoolError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Send a request and decode the JSON body of a 2xx response
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, PoolError> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(PoolError::Http {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| PoolError::InvalidResponse(format!("{}: {}", e, body)))
    }

    /// Send a request whose response is a success envelope and decode it
    async fn send_envelope<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, PoolError> {
        let value = self.send(request).await?;
        check_envelope(&value)?;
        serde_json::from_value(value).map_err(|e| PoolError::InvalidResponse(e.to_string()))
    }
}

/// Reject `success: false` envelopes
fn check_envelope(value: &Value) -> Result<(), PoolError> {
    match value.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(()),
        Some(false) => Err(PoolError::Rejected(envelope_error(value))),
        None => Err(PoolError::InvalidResponse(
            "missing 'success' field".to_string(),
        )),
    }
}

fn envelope_error(value: &Value) -> String {
    value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("Unknown error")
        .to_string()
}

fn map_transport_error(e: reqwest::Error) -> PoolError {
    if e.is_timeout() {
        PoolError::Timeout
    } else {
        PoolError::Transport(e.to_string())
    }
}

/// Whether a rejection means the key was not leased in the first place
fn is_unknown_key(message: &str) -> bool {
    let message = message.to_lowercase();
    ["not found", "unknown", "not allocated", "not in use", "already released"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[async_trait]
impl KeyPool for KeyPoolClient {
    async fn lease(&self, endpoint_hint: Option<&str>) -> Result<Lease, PoolError> {
        let mut request = self.http.get(self.url("allocate"));
        if let Some(ip) = endpoint_hint {
            request = request.query(&[("ip", ip)]);
        }

        debug!(endpoint_hint = ?endpoint_hint, "Requesting key lease");
        let lease: Lease = self.send_envelope(request).await?;
        info!(
            endpoint = %lease.endpoint(),
            internal_address = %lease.internal_address,
            "✅ Key leased"
        );
        Ok(lease)
    }

    async fn release(&self, public_key: &str) -> Result<ReleaseOutcome, PoolError> {
        let request = self
            .http
            .post(self.url("release"))
            .json(&serde_json::json!({ "public_key": public_key }));

        let value = match self.send(request).await {
            Ok(value) => value,
            Err(PoolError::Http { status: 404, .. }) => {
                warn!("Pool server does not know this key (404), treating as returned");
                return Ok(ReleaseOutcome::NotLeased);
            }
            Err(e) => return Err(e),
        };

        match check_envelope(&value) {
            Ok(()) => {
                info!("✅ Key returned");
                Ok(ReleaseOutcome::Released)
            }
            Err(PoolError::Rejected(message)) if is_unknown_key(&message) => {
                warn!(reason = %message, "Key was not leased, treating as returned");
                Ok(ReleaseOutcome::NotLeased)
            }
            Err(e) => Err(e),
        }
    }

    async fn status(&self, endpoint_hint: Option<&str>) -> Result<PoolStatus, PoolError> {
        let mut request = self.http.get(self.url("status"));
        if let Some(ip) = endpoint_hint {
            request = request.query(&[("ip", ip)]);
        }
        self.send_envelope(request).await
    }

    async fn list(&self) -> Result<Vec<String>, PoolError> {
        let value = self.send(self.http.get(self.url("list"))).await?;
        if value.is_object() {
            check_envelope(&value)?;
        }
        let list: ServerList = serde_json::from_value(value)
            .map_err(|e| PoolError::InvalidResponse(e.to_string()))?;
        Ok(match list {
            ServerList::Envelope { servers } => servers,
            ServerList::Bare(servers) => servers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = KeyPoolClient::new(PoolClientConfig {
            base_url: "http://pool.example/vpn_api/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://pool.example/vpn_api");
        assert_eq!(client.url("allocate"), "http://pool.example/vpn_api/allocate");
    }

    #[test]
    fn test_check_envelope() {
        assert!(check_envelope(&serde_json::json!({"success": true})).is_ok());

        match check_envelope(&serde_json::json!({"success": false, "error": "pool exhausted"})) {
            Err(PoolError::Rejected(message)) => assert_eq!(message, "pool exhausted"),
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            check_envelope(&serde_json::json!({"servers": []})),
            Err(PoolError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_unknown_key_detection() {
        assert!(is_unknown_key("Key not found"));
        assert!(is_unknown_key("unknown public key"));
        assert!(is_unknown_key("Key is not allocated"));
        assert!(!is_unknown_key("database unavailable"));
    }
}
