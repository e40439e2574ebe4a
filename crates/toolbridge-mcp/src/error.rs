//! Error types for MCP operations.

use thiserror::Error;

/// Errors from MCP server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("Failed to connect to MCP server at {url}: {message}")]
    Connect { url: String, message: String },

    #[error("MCP server at {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Transport already started")]
    AlreadyStarted,

    #[error("MCP client has not been started")]
    NotStarted,

    #[error("MCP client is not initialized")]
    NotInitialized,

    #[error("MCP connection closed")]
    Closed,

    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("MCP request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("MCP request '{method}' was cancelled")]
    Cancelled { method: String },

    #[error("Unknown MCP tool: {name}")]
    UnknownTool { name: String },

    #[error("No MCP server advertises resource: {uri}")]
    UnknownResource { uri: String },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_display() {
        let err = McpError::Rpc {
            code: -32601,
            message: "Method not found".to_string(),
            data: None,
        };
        assert_eq!(err.to_string(), "RPC error -32601: Method not found");
    }

    #[test]
    fn timeout_display_names_method() {
        let err = McpError::Timeout {
            method: "tools/call".to_string(),
            timeout_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "MCP request 'tools/call' timed out after 250ms"
        );
    }
}
