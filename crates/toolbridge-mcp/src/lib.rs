//! MCP (Model Context Protocol) client.
//!
//! Talks JSON-RPC 2.0 to independent tool/resource servers over two transports:
//! a child process's stdio (newline-delimited JSON) and an HTTP event stream
//! (SSE in, POST out). Each configured server gets one [`McpClient`]; the
//! [`McpManager`] builds a namespaced catalog across all of them.

pub mod client;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod manager;
pub mod notification;
mod pending;
pub mod protocol;
pub mod transport;

pub use client::{ClientState, McpClient, RequestOptions};
pub use config::{McpConfig, McpServerConfig, SseServerConfig, StdioServerConfig};
pub use error::McpError;
pub use manager::{CatalogResource, CatalogTool, McpManager, namespaced_tool_name};
pub use notification::SubscriptionId;
pub use protocol::{CallToolResult, Resource, ResourceContents, Tool, ToolContent};
pub use transport::{SseTransport, StdioTransport, Transport};
