//! Configuration types for MCP servers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

fn default_timeout() -> u64 {
    30000
}

/// Top-level MCP configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

/// Configuration for a single MCP server. The transport is chosen by which
/// keys are present: `command` for stdio, `url` for SSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpServerConfig {
    Stdio(StdioServerConfig),
    Sse(SseServerConfig),
}

impl McpServerConfig {
    /// Per-request deadline, `None` when `timeout_ms` is 0.
    pub fn request_timeout(&self) -> Option<Duration> {
        let ms = match self {
            McpServerConfig::Stdio(c) => c.timeout_ms,
            McpServerConfig::Sse(c) => c.timeout_ms,
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        match self {
            McpServerConfig::Stdio(c) => c.timeout_ms = timeout_ms,
            McpServerConfig::Sse(c) => c.timeout_ms = timeout_ms,
        }
    }
}

/// A server spawned as a child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioServerConfig {
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the server process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Timeout for requests in milliseconds (default: 30000, 0 disables).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

/// A server reached over an HTTP event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseServerConfig {
    /// URL of the event stream.
    pub url: String,
    /// Endpoint for outbound messages; derived from `url` when absent.
    #[serde(default)]
    pub message_url: Option<String>,
    /// Timeout for requests in milliseconds (default: 30000, 0 disables).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_stdio_server() {
        let toml_str = r#"
[servers.filesystem]
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/home/user"]
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.servers.len(), 1);
        match &config.servers["filesystem"] {
            McpServerConfig::Stdio(fs) => {
                assert_eq!(fs.command, "npx");
                assert_eq!(fs.args.len(), 3);
                assert_eq!(fs.timeout_ms, 30000); // default
            }
            other => panic!("Expected stdio config, got {other:?}"),
        }
    }

    #[test]
    fn parse_sse_server() {
        let toml_str = r#"
[servers.research]
url = "http://localhost:9000/sse"
timeout_ms = 60000
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        match &config.servers["research"] {
            McpServerConfig::Sse(sse) => {
                assert_eq!(sse.url, "http://localhost:9000/sse");
                assert!(sse.message_url.is_none());
                assert_eq!(sse.timeout_ms, 60000);
            }
            other => panic!("Expected sse config, got {other:?}"),
        }
    }

    #[test]
    fn parse_mixed_servers_in_name_order() {
        let toml_str = r#"
[servers.zeta]
url = "http://localhost:9000/sse"

[servers.alpha]
command = "python"
args = ["server.py"]
cwd = "/srv/mcp"
env = { API_TOKEN = "xxxx" }
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        let names: Vec<&str> = config.servers.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        match &config.servers["alpha"] {
            McpServerConfig::Stdio(c) => {
                assert_eq!(c.env["API_TOKEN"], "xxxx");
                assert_eq!(c.cwd.as_deref(), Some(std::path::Path::new("/srv/mcp")));
            }
            other => panic!("Expected stdio config, got {other:?}"),
        }
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let toml_str = r#"
[servers.slow]
command = "slow-server"
timeout_ms = 0
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        assert!(config.servers["slow"].request_timeout().is_none());
    }

    #[test]
    fn default_timeout_is_thirty_seconds() {
        let config: McpConfig = toml::from_str("[servers.a]\ncommand = \"a\"\n").unwrap();
        assert_eq!(
            config.servers["a"].request_timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn default_config_is_empty() {
        let config = McpConfig::default();
        assert!(config.servers.is_empty());
    }
}
