//! Stdio transport for MCP server communication.
//!
//! Spawns a child process and exchanges newline-delimited JSON-RPC messages
//! over its stdin/stdout. Stderr is drained in the background and logged.

use super::{BoxFuture, MAX_LINE_BYTES, MessageHandler, Transport};
use crate::config::StdioServerConfig;
use crate::error::McpError;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Async stdio transport for communicating with an MCP server process.
pub struct StdioTransport {
    server: String,
    config: StdioServerConfig,
    started: AtomicBool,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    shutdown: CancellationToken,
}

impl StdioTransport {
    /// Create a transport for `config`. Nothing is spawned until [`Transport::start`].
    pub fn new(server: impl Into<String>, config: StdioServerConfig) -> Self {
        Self {
            server: server.into(),
            config,
            started: AtomicBool::new(false),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    fn unusable(&self) -> McpError {
        if self.shutdown.is_cancelled() {
            McpError::Closed
        } else {
            McpError::NotStarted
        }
    }

    async fn spawn(&self) -> Result<(), McpError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: self.config.command.clone(),
            source: e,
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(McpError::Protocol(
                "child process stdio was not piped".to_string(),
            ));
        };

        if let Some(stderr) = child.stderr.take() {
            let server = self.server.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => tracing::debug!("MCP server '{server}' stderr: {line}"),
                            Ok(None) | Err(_) => break,
                        },
                    }
                }
            });
        }

        tracing::debug!(
            "Spawned MCP server '{}': {} {}",
            self.server,
            self.config.command,
            self.config.args.join(" ")
        );

        *self.stdin.lock().await = Some(stdin);
        *self.stdout.lock().await = Some(stdout);
        *self.child.lock().await = Some(child);
        Ok(())
    }
}

impl Transport for StdioTransport {
    fn start(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            if self.shutdown.is_cancelled() {
                return Err(McpError::Closed);
            }
            if self.started.swap(true, Ordering::SeqCst) {
                return Err(McpError::AlreadyStarted);
            }
            self.spawn().await
        })
    }

    fn write_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<(), McpError>> {
        Box::pin(async move {
            let mut guard = self.stdin.lock().await;
            let stdin = guard.as_mut().ok_or_else(|| self.unusable())?;
            // A child that stops reading fills the pipe; close must still get the lock.
            tokio::select! {
                _ = self.shutdown.cancelled() => Err(McpError::Closed),
                written = async {
                    stdin.write_all(message).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                } => Ok(written?),
            }
        })
    }

    fn run_read_loop(&self, mut handler: MessageHandler) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            let stdout = self
                .stdout
                .lock()
                .await
                .take()
                .ok_or_else(|| self.unusable())?;

            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(()),
                    read = read_line(&mut reader, &mut line, MAX_LINE_BYTES) => match read? {
                        LineRead::Line => {
                            if !line.iter().all(u8::is_ascii_whitespace) {
                                handler(&line);
                            }
                        }
                        LineRead::TooLong => tracing::debug!(
                            "MCP server '{}' sent a line over {MAX_LINE_BYTES} bytes; dropped",
                            self.server
                        ),
                        LineRead::Eof => return Ok(()),
                    },
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), McpError>> {
        Box::pin(async move {
            self.shutdown.cancel();
            if let Some(mut child) = self.child.lock().await.take() {
                if let Err(e) = child.kill().await {
                    tracing::debug!("Failed to kill MCP server '{}': {e}", self.server);
                }
            }
            self.stdin.lock().await.take();
            Ok(())
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    TooLong,
    Eof,
}

/// Read one `\n`-terminated line into `line` without the terminator, keeping
/// at most `max` bytes. Bytes are passed through undecoded.
async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<LineRead> {
    line.clear();
    let mut too_long = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (too_long, line.is_empty()) {
                (true, _) => LineRead::TooLong,
                (false, true) => LineRead::Eof,
                // Final line without a terminator.
                (false, false) => LineRead::Line,
            });
        }

        let (chunk, used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (&available[..pos], pos + 1, true),
            None => (available, available.len(), false),
        };
        if !too_long {
            if line.len() + chunk.len() > max {
                too_long = true;
                line.clear();
            } else {
                line.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if done {
            return Ok(if too_long {
                LineRead::TooLong
            } else {
                LineRead::Line
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config(command: &str, args: &[&str]) -> StdioServerConfig {
        StdioServerConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            timeout_ms: 5000,
        }
    }

    fn collecting_handler() -> (MessageHandler, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Box::new(move |bytes: &[u8]| {
            let _ = tx.send(String::from_utf8_lossy(bytes).into_owned());
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn spawn_echo_process() {
        let transport = StdioTransport::new("cat", config("cat", &[]));
        assert!(transport.start().await.is_ok());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_nonexistent_command_fails() {
        let transport = StdioTransport::new(
            "missing",
            config("this_command_does_not_exist_xyz123", &[]),
        );
        match transport.start().await {
            Err(McpError::SpawnFailed { name, .. }) => {
                assert_eq!(name, "this_command_does_not_exist_xyz123");
            }
            Err(other) => panic!("Expected SpawnFailed, got: {other:?}"),
            Ok(_) => panic!("Expected error, got Ok"),
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let transport = StdioTransport::new("cat", config("cat", &[]));
        transport.start().await.unwrap();
        assert!(matches!(
            transport.start().await,
            Err(McpError::AlreadyStarted)
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_before_start_fails() {
        let transport = StdioTransport::new("cat", config("cat", &[]));
        assert!(matches!(
            transport.write_message(b"{}").await,
            Err(McpError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn cat_echoes_lines_back() {
        let transport = Arc::new(StdioTransport::new("cat", config("cat", &[])));
        transport.start().await.unwrap();

        let (handler, mut rx) = collecting_handler();
        let reader = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.run_read_loop(handler).await })
        };

        transport
            .write_message(br#"{"jsonrpc":"2.0","method":"ping"}"#)
            .await
            .unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","method":"ping"}"#);

        transport.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stderr_is_not_protocol_data() {
        let transport = Arc::new(StdioTransport::new(
            "noisy",
            config("sh", &["-c", "echo 'not json' >&2; echo '{\"jsonrpc\":\"2.0\",\"method\":\"hi\"}'"]),
        ));
        transport.start().await.unwrap();

        let (handler, mut rx) = collecting_handler();
        transport.run_read_loop(handler).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), r#"{"jsonrpc":"2.0","method":"hi"}"#);
        assert!(rx.try_recv().is_err());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let transport = StdioTransport::new("cat", config("cat", &[]));
        transport.start().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.write_message(b"{}").await,
            Err(McpError::Closed)
        ));
    }

    #[tokio::test]
    async fn read_line_passes_raw_bytes_and_bounds_length() {
        let input: &[u8] = b"\xff\xfe\n0123456789\nshort\nlast";
        let mut reader = BufReader::with_capacity(4, input);
        let mut line = Vec::new();

        assert_eq!(read_line(&mut reader, &mut line, 8).await.unwrap(), LineRead::Line);
        assert_eq!(line, b"\xff\xfe");
        assert_eq!(read_line(&mut reader, &mut line, 8).await.unwrap(), LineRead::TooLong);
        assert!(line.is_empty());
        assert_eq!(read_line(&mut reader, &mut line, 8).await.unwrap(), LineRead::Line);
        assert_eq!(line, b"short");
        assert_eq!(read_line(&mut reader, &mut line, 8).await.unwrap(), LineRead::Line);
        assert_eq!(line, b"last");
        assert_eq!(read_line(&mut reader, &mut line, 8).await.unwrap(), LineRead::Eof);
    }

    #[tokio::test]
    async fn non_utf8_line_does_not_end_read_loop() {
        let transport = Arc::new(StdioTransport::new(
            "binary",
            config(
                "sh",
                &["-c", "printf '\\377\\376\\n'; echo '{\"jsonrpc\":\"2.0\",\"method\":\"after\"}'"],
            ),
        ));
        transport.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let handler: MessageHandler = Box::new(move |bytes: &[u8]| {
            let _ = tx.send(bytes.to_vec());
        });
        transport.run_read_loop(handler).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), vec![0xff, 0xfe]);
        assert_eq!(
            rx.recv().await.unwrap(),
            br#"{"jsonrpc":"2.0","method":"after"}"#.to_vec()
        );
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_does_not_wait_for_a_blocked_write() {
        // The child never reads stdin, so a large write fills the pipe.
        let transport = Arc::new(StdioTransport::new("deaf", config("sleep", &["30"])));
        transport.start().await.unwrap();

        let writer = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                let message = vec![b'x'; 1 << 20];
                transport.write_message(&message).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), transport.close())
            .await
            .expect("close finished")
            .unwrap();
        let written = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(written.is_err());
    }
}
