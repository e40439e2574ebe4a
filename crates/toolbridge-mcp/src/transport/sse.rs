//! Server-Sent Events transport.
//!
//! Inbound messages arrive as `data: <json>` lines on a long-lived streaming
//! GET; outbound messages are POSTed one per request to a message endpoint.

use super::{BoxFuture, MAX_LINE_BYTES, MessageHandler, Transport};
use crate::config::SseServerConfig;
use crate::error::McpError;
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Derive the outbound message endpoint from the event-stream URL.
///
/// A trailing `/sse` segment becomes `/message`; any other path gets `/message`
/// appended. The query string is carried over.
pub fn derive_message_url(url: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };
    let base = base.trim_end_matches('/');
    let derived = match base.strip_suffix("/sse") {
        Some(prefix) => format!("{prefix}/message"),
        None => format!("{base}/message"),
    };
    match query {
        Some(query) => format!("{derived}?{query}"),
        None => derived,
    }
}

/// Incremental splitter that turns streamed bytes into `data:` payloads.
///
/// Lines may be split across chunks; only complete lines are emitted. Lines
/// longer than the limit are dropped.
#[derive(Debug)]
pub struct EventLineDecoder {
    buffer: BytesMut,
    max_line: usize,
    discarding: bool,
}

impl Default for EventLineDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl EventLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_line,
            discarding: false,
        }
    }

    /// Feed a chunk of bytes and return the payload of every complete data line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if pos > self.max_line {
                tracing::debug!("Dropped event stream line of {pos} bytes");
                continue;
            }
            if let Some(payload) = data_payload(&line[..pos]) {
                payloads.push(payload);
            }
        }

        if self.buffer.len() > self.max_line {
            tracing::debug!(
                "Dropping event stream line over {} bytes",
                self.max_line
            );
            self.buffer.clear();
            self.discarding = true;
        }

        payloads
    }

    /// Flush a final unterminated line once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let rest = line.strip_prefix(b"data:")?;
    // Per the SSE format, one leading space is not part of the value.
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);
    if rest.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(rest).into_owned())
}

/// MCP transport over an HTTP event stream.
pub struct SseTransport {
    http: reqwest::Client,
    url: String,
    message_url: String,
    started: AtomicBool,
    stream: Mutex<Option<reqwest::Response>>,
    shutdown: CancellationToken,
}

impl SseTransport {
    pub fn new(config: &SseServerConfig) -> Result<Self, McpError> {
        let mut builder = reqwest::Client::builder();
        if let Some(ms) = config.connect_timeout_ms {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }
        let http = builder.build()?;

        let message_url = config
            .message_url
            .clone()
            .unwrap_or_else(|| derive_message_url(&config.url));

        Ok(Self {
            http,
            url: config.url.clone(),
            message_url,
            started: AtomicBool::new(false),
            stream: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// The endpoint outbound messages are POSTed to.
    pub fn message_url(&self) -> &str {
        &self.message_url
    }

    async fn open_stream(&self) -> Result<reqwest::Response, McpError> {
        tracing::debug!("GET {} (event stream)", self.url);
        let response = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::Connect {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    fn ensure_usable(&self) -> Result<(), McpError> {
        if self.shutdown.is_cancelled() {
            Err(McpError::Closed)
        } else if !self.started.load(Ordering::SeqCst) {
            Err(McpError::NotStarted)
        } else {
            Ok(())
        }
    }
}

impl Transport for SseTransport {
    fn start(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if self.shutdown.is_cancelled() {
                return Err(McpError::Closed);
            }
            if self.started.swap(true, Ordering::SeqCst) {
                return Err(McpError::AlreadyStarted);
            }
            let response = self.open_stream().await?;
            *self.stream.lock().await = Some(response);
            Ok(())
        })
    }

    fn write_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<(), McpError>> {
        Box::pin(async move {
            self.ensure_usable()?;
            let response = self
                .http
                .post(&self.message_url)
                .header(CONTENT_TYPE, "application/json")
                .body(message.to_vec())
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(McpError::HttpStatus {
                    url: self.message_url.clone(),
                    status: status.as_u16(),
                });
            }
            Ok(())
        })
    }

    fn run_read_loop(&self, mut handler: MessageHandler) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            self.ensure_usable()?;
            let existing = self.stream.lock().await.take();
            let response = match existing {
                Some(response) => response,
                None => self.open_stream().await?,
            };

            let mut body = response.bytes_stream();
            let mut decoder = EventLineDecoder::new();
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    chunk = body.next() => match chunk {
                        Some(Ok(chunk)) => {
                            for payload in decoder.feed(&chunk) {
                                handler(payload.as_bytes());
                            }
                        }
                        Some(Err(e)) => return Err(McpError::Http(e)),
                        None => {
                            if let Some(payload) = decoder.finish() {
                                handler(payload.as_bytes());
                            }
                            return Ok(());
                        }
                    },
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            self.shutdown.cancel();
            self.stream.lock().await.take();
            Ok(())
        })
    }
}
