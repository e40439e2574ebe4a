//! JSON-RPC 2.0 types for MCP communication.

use crate::error::McpError;
use serde::{Deserialize, Serialize};

/// The only JSON-RPC version spoken on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// A successful response carrying `result`.
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// An error response.
    pub fn failure(id: u64, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }

    /// Convert into the raw result payload, turning an error object into [`McpError::Rpc`].
    ///
    /// A response with neither field set yields JSON `null`.
    pub fn into_result(self) -> Result<serde_json::Value, McpError> {
        if let Some(err) = self.error {
            return Err(McpError::Rpc {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(self.result.unwrap_or(serde_json::Value::Null))
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params,
        }
    }
}

/// An inbound message, classified by which envelope fields it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Has a non-zero id and no method: answers one of our requests.
    Response(JsonRpcResponse),
    /// Has a method and no id.
    Notification(JsonRpcNotification),
    /// Has both a method and an id: a request initiated by the server.
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Decode one inbound message from its raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, McpError> {
        let raw: RawMessage = serde_json::from_slice(bytes)?;
        let jsonrpc = raw.jsonrpc.unwrap_or_else(default_version);
        let id = raw.id.filter(|id| !id.is_null());

        match (raw.method, id) {
            (Some(method), None) => Ok(Self::Notification(JsonRpcNotification {
                jsonrpc,
                method,
                params: raw.params,
            })),
            (Some(method), Some(id)) => Ok(Self::ServerRequest { id, method }),
            (None, Some(id)) => match id.as_u64() {
                Some(id) if id != 0 => Ok(Self::Response(JsonRpcResponse {
                    jsonrpc,
                    id: Some(id),
                    result: raw.result,
                    error: raw.error,
                })),
                _ => Err(McpError::Protocol(format!(
                    "response id {id} does not match any request this client issues"
                ))),
            },
            (None, None) => Err(McpError::Protocol(
                "message has neither an id nor a method".to_string(),
            )),
        }
    }
}
