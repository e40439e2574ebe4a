//! Wire transports for MCP server communication.
//!
//! A transport moves opaque encoded JSON-RPC messages; it knows nothing about
//! request ids or method names. [`McpClient`](crate::McpClient) drives exactly
//! one transport and never branches on which kind it is.

mod sse;
mod stdio;

pub use sse::{EventLineDecoder, SseTransport, derive_message_url};
pub use stdio::StdioTransport;

use crate::error::McpError;
use std::future::Future;
use std::pin::Pin;

/// Inbound lines longer than this are dropped instead of buffered.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Boxed future returned by [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback receiving the raw bytes of each inbound message.
pub type MessageHandler = Box<dyn FnMut(&[u8]) + Send>;

/// A bidirectional message channel to one MCP server.
pub trait Transport: Send + Sync {
    /// Establish the connection. Fails with [`McpError::AlreadyStarted`] on a second call.
    fn start(&self) -> BoxFuture<'_, Result<(), McpError>>;

    /// Send exactly one encoded message.
    fn write_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<(), McpError>>;

    /// Deliver inbound messages to `handler` until the connection ends or
    /// [`close`](Transport::close) is called.
    fn run_read_loop(&self, handler: MessageHandler) -> BoxFuture<'_, Result<(), McpError>>;

    /// Release the connection and stop any running read loop. Safe to call twice.
    fn close(&self) -> BoxFuture<'_, Result<(), McpError>>;
}
