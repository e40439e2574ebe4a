//! MCP manager: orchestrates multiple MCP server connections.
//!
//! Builds a capability catalog at startup and routes tool calls and resource
//! reads to the server that advertised them.

use crate::client::{McpClient, RequestOptions};
use crate::config::McpConfig;
use crate::error::McpError;
use crate::protocol::{
    CallToolResult, NOTIFICATION_RESOURCES_LIST_CHANGED, NOTIFICATION_TOOLS_LIST_CHANGED,
    Resource, ResourceContents, Tool,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Build the catalog name for a server's tool.
///
/// The `mcp__server__tool` pattern keeps tools from different servers apart.
pub fn namespaced_tool_name(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

/// A tool in the catalog, paired with the server that exposes it.
#[derive(Debug, Clone)]
pub struct CatalogTool {
    pub namespaced_name: String,
    pub server: String,
    pub tool: Tool,
}

impl CatalogTool {
    pub fn description(&self) -> String {
        format!(
            "[MCP: {}] {}",
            self.server,
            self.tool.description.as_deref().unwrap_or_default()
        )
    }
}

/// A resource in the catalog, paired with the server that exposes it.
#[derive(Debug, Clone)]
pub struct CatalogResource {
    pub server: String,
    pub resource: Resource,
}

/// Manages connections to multiple MCP servers.
pub struct McpManager {
    clients: HashMap<String, Arc<McpClient>>,
    tools: Vec<CatalogTool>,
    tool_index: HashMap<String, usize>,
    resources: Vec<CatalogResource>,
}

impl McpManager {
    /// Start all configured MCP servers, in name order.
    ///
    /// Servers that fail to start are logged and skipped; the host continues
    /// with whatever servers are available.
    pub async fn start(config: &McpConfig) -> Self {
        let mut manager = Self {
            clients: HashMap::new(),
            tools: Vec::new(),
            tool_index: HashMap::new(),
            resources: Vec::new(),
        };

        for (name, server_config) in &config.servers {
            let client = match McpClient::connect(name.clone(), server_config).await {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!("Failed to start MCP server '{}': {}", name, e);
                    continue;
                }
            };

            match discover_capabilities(&client).await {
                Ok((tools, resources)) => {
                    tracing::info!(
                        "MCP server '{}' started ({} tools, {} resources)",
                        name,
                        tools.len(),
                        resources.len()
                    );
                    watch_list_changes(&client);
                    manager.add_server(Arc::new(client), tools, resources);
                }
                Err(e) => {
                    tracing::warn!("Failed to list capabilities of MCP server '{}': {}", name, e);
                    let _ = client.close().await;
                }
            }
        }

        manager
    }

    fn add_server(&mut self, client: Arc<McpClient>, tools: Vec<Tool>, resources: Vec<Resource>) {
        let server = client.server_name().to_string();
        for tool in tools {
            let namespaced_name = namespaced_tool_name(&server, &tool.name);
            if self.tool_index.contains_key(&namespaced_name) {
                tracing::warn!("Duplicate MCP tool '{namespaced_name}' ignored");
                continue;
            }
            self.tool_index
                .insert(namespaced_name.clone(), self.tools.len());
            self.tools.push(CatalogTool {
                namespaced_name,
                server: server.clone(),
                tool,
            });
        }
        self.resources
            .extend(resources.into_iter().map(|resource| CatalogResource {
                server: server.clone(),
                resource,
            }));
        self.clients.insert(server, client);
    }

    /// Every tool from every connected server.
    pub fn tools(&self) -> &[CatalogTool] {
        &self.tools
    }

    /// Every resource from every connected server.
    pub fn resources(&self) -> &[CatalogResource] {
        &self.resources
    }

    pub fn client(&self, server: &str) -> Option<&Arc<McpClient>> {
        self.clients.get(server)
    }

    /// Number of connected servers.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Connected servers and their tool counts, sorted by name.
    pub fn server_summary(&self) -> Vec<(&str, usize)> {
        let mut summary: Vec<(&str, usize)> = self
            .clients
            .keys()
            .map(|name| {
                let count = self.tools.iter().filter(|t| &t.server == name).count();
                (name.as_str(), count)
            })
            .collect();
        summary.sort_unstable();
        summary
    }

    /// Call a tool by its namespaced name.
    pub async fn call_tool(
        &self,
        namespaced_name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        self.call_tool_with(namespaced_name, arguments, &RequestOptions::default())
            .await
    }

    pub async fn call_tool_with(
        &self,
        namespaced_name: &str,
        arguments: serde_json::Value,
        options: &RequestOptions,
    ) -> Result<CallToolResult, McpError> {
        let entry = self
            .tool_index
            .get(namespaced_name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| McpError::UnknownTool {
                name: namespaced_name.to_string(),
            })?;
        let client = self.clients.get(&entry.server).ok_or_else(|| McpError::UnknownTool {
            name: namespaced_name.to_string(),
        })?;
        client
            .call_tool_with(&entry.tool.name, arguments, options)
            .await
    }

    /// Read a resource from whichever server advertised its URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        let client = self
            .resources
            .iter()
            .find(|r| r.resource.uri == uri)
            .and_then(|r| self.clients.get(&r.server))
            .ok_or_else(|| McpError::UnknownResource {
                uri: uri.to_string(),
            })?;
        client.read_resource(uri).await
    }

    /// Shut down all connected servers.
    pub async fn shutdown(self) {
        for (name, client) in self.clients {
            if let Err(e) = client.close().await {
                tracing::debug!("Error closing MCP server '{name}': {e}");
            }
        }
    }
}

/// Fetch tools and resources for the capabilities the server declared.
async fn discover_capabilities(
    client: &McpClient,
) -> Result<(Vec<Tool>, Vec<Resource>), McpError> {
    let (has_tools, has_resources) = client
        .capabilities()
        .map(|c| (c.tools.is_some(), c.resources.is_some()))
        .unwrap_or((true, true));

    let tools = if has_tools {
        tolerate_rpc_error(client.server_name(), "tools/list", client.list_tools()).await?
    } else {
        Vec::new()
    };
    let resources = if has_resources {
        tolerate_rpc_error(client.server_name(), "resources/list", client.list_resources())
            .await?
    } else {
        Vec::new()
    };
    Ok((tools, resources))
}

/// A server that rejects a list method simply has nothing to list; transport
/// failures still propagate.
async fn tolerate_rpc_error<T>(
    server: &str,
    method: &str,
    fut: impl Future<Output = Result<Vec<T>, McpError>>,
) -> Result<Vec<T>, McpError> {
    match fut.await {
        Err(e @ McpError::Rpc { .. }) => {
            tracing::debug!("MCP server '{server}' rejected {method}: {e}");
            Ok(Vec::new())
        }
        other => other,
    }
}

fn watch_list_changes(client: &McpClient) {
    for method in [
        NOTIFICATION_TOOLS_LIST_CHANGED,
        NOTIFICATION_RESOURCES_LIST_CHANGED,
    ] {
        let server = client.server_name().to_string();
        client.on_notification(method, move |n| {
            tracing::info!("MCP server '{server}' reported {}; catalog refreshes on restart", n.method);
        });
    }
}
