//! End-to-end tests over the stdio transport, using a small `sh` script as the
//! MCP server. Requests are answered by matching on the method name in the
//! raw line; the id is cut out with `sed`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use toolbridge_mcp::{
    McpClient, McpConfig, McpError, McpManager, McpServerConfig, RequestOptions,
    StdioServerConfig,
};

const MOCK_SERVER: &str = r##"
echo "mock server starting" >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-server","version":"1.0.0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"debug"}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echo result"}],"isError":false}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
  esac
done
"##;

fn shell_config(script: &str) -> McpServerConfig {
    McpServerConfig::Stdio(StdioServerConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: HashMap::new(),
        cwd: None,
        timeout_ms: 0,
    })
}

/// Params large enough to fill a pipe nobody reads.
fn oversized_params() -> serde_json::Value {
    json!({"blob": "x".repeat(1 << 20)})
}

fn mock_server_config() -> McpServerConfig {
    McpServerConfig::Stdio(StdioServerConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), MOCK_SERVER.to_string()],
        env: HashMap::new(),
        cwd: None,
        timeout_ms: 5000,
    })
}

#[tokio::test]
async fn client_talks_to_child_process() {
    let client = McpClient::connect("shell", &mock_server_config())
        .await
        .unwrap();
    assert_eq!(client.server_info().unwrap().name, "sh-server");

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    let result = client
        .call_tool("echo", json!({"msg": "hello"}))
        .await
        .unwrap();
    assert_eq!(result.text(), "echo result");

    let err = client.send_request("bogus/method", None).await.unwrap_err();
    assert_eq!(err.to_string(), "RPC error -32601: Method not found");

    client.close().await.unwrap();
}

#[tokio::test]
async fn manager_builds_namespaced_catalog() {
    let mut servers = BTreeMap::new();
    servers.insert("shell".to_string(), mock_server_config());
    servers.insert(
        "broken".to_string(),
        McpServerConfig::Stdio(StdioServerConfig {
            command: "nonexistent_command_xyz123".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            timeout_ms: 1000,
        }),
    );
    let manager = McpManager::start(&McpConfig { servers }).await;

    assert_eq!(manager.client_count(), 1);
    assert_eq!(manager.server_summary(), vec![("shell", 1)]);
    assert!(manager.resources().is_empty());

    let tool = &manager.tools()[0];
    assert_eq!(tool.namespaced_name, "mcp__shell__echo");
    assert_eq!(tool.description(), "[MCP: shell] Echo");

    let result = manager
        .call_tool("mcp__shell__echo", json!({"msg": "hi"}))
        .await
        .unwrap();
    assert_eq!(result.text(), "echo result");

    assert!(matches!(
        manager.call_tool("mcp__broken__echo", json!({})).await,
        Err(McpError::UnknownTool { .. })
    ));

    manager.shutdown().await;
}

#[tokio::test]
async fn deadline_applies_while_write_is_blocked() {
    let client = McpClient::from_config("deaf", &shell_config("sleep 30")).unwrap();
    client.start().await.unwrap();

    let opts = RequestOptions::with_timeout(Duration::from_millis(200));
    let call = client.send_request_with("tools/call", Some(oversized_params()), &opts);
    let err = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("deadline fired")
        .unwrap_err();
    assert!(matches!(err, McpError::Timeout { .. }), "got {err:?}");
    assert_eq!(client.pending_requests(), 0);

    tokio::time::timeout(Duration::from_secs(5), client.close())
        .await
        .expect("close finished")
        .unwrap();
}

#[tokio::test]
async fn close_unblocks_call_stuck_in_write() {
    let client = Arc::new(McpClient::from_config("deaf", &shell_config("sleep 30")).unwrap());
    client.start().await.unwrap();

    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .send_request("tools/call", Some(oversized_params()))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), client.close())
        .await
        .expect("close finished")
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("call unblocked")
        .unwrap();
    assert!(matches!(result, Err(McpError::Closed)), "got {result:?}");
}

#[tokio::test]
async fn non_utf8_line_is_skipped() {
    let script = r#"printf '\377\376\n'; read line; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; sleep 5"#;
    let client = McpClient::from_config("binary", &shell_config(script)).unwrap();
    client.start().await.unwrap();
    // Let the bad line arrive before anything is pending.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = tokio::time::timeout(Duration::from_secs(5), client.send_request("ping", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, json!({"ok": true}));
    client.close().await.unwrap();
}

#[tokio::test]
async fn server_exit_fails_pending_request() {
    // Reads the request, then exits without answering.
    let client = McpClient::from_config("quitter", &shell_config("read line; exit 0")).unwrap();
    client.start().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), client.send_request("ping", None))
        .await
        .expect("request failed promptly")
        .unwrap_err();
    assert!(matches!(err, McpError::Closed), "got {err:?}");
    assert_eq!(client.pending_requests(), 0);
    assert!(matches!(
        client.send_request("ping", None).await,
        Err(McpError::Closed)
    ));
    client.close().await.unwrap();
}
