//! Toolbridge CLI: list and call tools exposed by configured MCP servers.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolbridge_config::{BridgeConfig, CliOverrides};
use toolbridge_mcp::{CallToolResult, McpManager, RequestOptions, ResourceContents, ToolContent};

#[derive(Parser)]
#[command(name = "toolbridge", version, about = "Bridge to MCP tool servers")]
struct Cli {
    /// Directory holding the global config.toml (overrides TOOLBRIDGE_CONFIG_DIR)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Project config file to use instead of ./toolbridge.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default request timeout in milliseconds for every server (0 disables)
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every tool in the catalog
    Tools,
    /// List every resource in the catalog
    Resources,
    /// Call a tool by its namespaced name (mcp__server__tool)
    Call {
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Deadline for this call in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Read a resource by URI
    Read { uri: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(CliOverrides {
        config_dir: cli.config_dir,
        config_file: cli.config,
        log_level: cli.verbose.then(|| "debug".to_string()),
        request_timeout_ms: cli.request_timeout_ms,
    })?;

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_writer(io::stderr)
        .init();

    if config.mcp.servers.is_empty() {
        bail!(
            "No MCP servers configured (looked in {} and ./{})",
            config.config_dir.join("config.toml").display(),
            toolbridge_config::PROJECT_CONFIG_FILE
        );
    }

    let manager = McpManager::start(&config.mcp).await;
    for (server, count) in manager.server_summary() {
        tracing::info!("MCP server '{server}': {count} tools");
    }

    let outcome = run(&manager, cli.command).await;
    manager.shutdown().await;

    match outcome? {
        true => Ok(()),
        false => std::process::exit(1),
    }
}

fn load_config(overrides: CliOverrides) -> Result<BridgeConfig> {
    // Config warnings are emitted before the configured filter exists.
    let bootstrap = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || BridgeConfig::load(overrides))
        .context("Failed to load configuration")
}

/// Run one command. Returns `false` when the tool reported a failure.
async fn run(manager: &McpManager, command: Command) -> Result<bool> {
    let mut out = io::stdout().lock();
    match command {
        Command::Tools => {
            for tool in manager.tools() {
                writeln!(out, "{}\t{}", tool.namespaced_name, tool.description())?;
            }
        }
        Command::Resources => {
            for entry in manager.resources() {
                let r = &entry.resource;
                let mime = r.mime_type.as_deref().unwrap_or("-");
                writeln!(out, "{}\t{}\t{}\t{}", entry.server, r.uri, r.name, mime)?;
            }
        }
        Command::Call {
            tool,
            args,
            timeout_ms,
        } => {
            drop(out);
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_ctrl_c.cancel();
                }
            });
            let options = RequestOptions {
                timeout: timeout_ms.map(Duration::from_millis),
                cancel: Some(cancel),
            };

            let result = manager.call_tool_with(&tool, arguments, &options).await?;
            return Ok(print_tool_result(&result)?);
        }
        Command::Read { uri } => {
            for contents in manager.read_resource(&uri).await? {
                match &contents {
                    ResourceContents::Text { text, .. } => writeln!(out, "{text}")?,
                    ResourceContents::Blob { blob, .. } => {
                        let mime = contents.mime_type().unwrap_or("application/octet-stream");
                        eprintln!("{}: {mime}, {} base64 chars", contents.uri(), blob.len());
                    }
                }
            }
        }
    }
    Ok(true)
}

/// Print tool output; text to stdout on success, everything to stderr on failure.
fn print_tool_result(result: &CallToolResult) -> io::Result<bool> {
    let mut out: Box<dyn Write> = if result.is_error {
        Box::new(io::stderr().lock())
    } else {
        Box::new(io::stdout().lock())
    };
    for item in &result.content {
        match item {
            ToolContent::Text { text } => writeln!(out, "{text}")?,
            ToolContent::Image { mime_type, data } => {
                writeln!(out, "[image {mime_type}, {} base64 chars]", data.len())?
            }
            ToolContent::Resource { resource } => match resource {
                ResourceContents::Text { text, .. } => writeln!(out, "{text}")?,
                ResourceContents::Blob { uri, .. } => writeln!(out, "[resource {uri}]")?,
            },
            ToolContent::Unsupported => writeln!(out, "[unsupported content]")?,
        }
    }
    Ok(!result.is_error)
}
