use crate::blockchain::client::ChainError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Sends one JSON-RPC request to one endpoint.
///
/// Implementations report unreachable endpoints as [`ChainError::Connection`]
/// so the client can rotate to the next URL, and JSON-RPC error objects as
/// [`ChainError::Rpc`].
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, ChainError>;
}

/// JSON-RPC over HTTP
pub struct HttpTransport {
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Decode(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("-> {} {} (id {})", endpoint, method, id);

        let response = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Connection {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        // Throttling and server errors mean "try another endpoint"
        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ChainError::Connection {
                endpoint: endpoint.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        let payload: Value = response.json().await.map_err(|e| ChainError::Connection {
            endpoint: endpoint.to_string(),
            reason: format!("invalid response body: {}", e),
        })?;

        parse_response(payload)
    }
}

/// Splits a JSON-RPC response envelope into its result or error
pub fn parse_response(mut payload: Value) -> Result<Value, ChainError> {
    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(ChainError::Rpc { code, message });
    }

    match payload.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(ChainError::Decode("response has neither result nor error".to_string())),
    }
}
