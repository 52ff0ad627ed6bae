//! Conduit CLI: talk to MCP servers and chat-completion endpoints.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use conduit_api::ChatClient;
use conduit_config::{CliOverrides, ConduitConfig};
use conduit_mcp::McpClient;
use conduit_types::{ChatRequest, Message, Usage};
use futures_util::StreamExt;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "conduit", version, about = "Talk to MCP servers and chat models")]
struct Cli {
    /// API key (overrides ANTHROPIC_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the tools a configured MCP server exposes
    Tools { server: String },

    /// Call a tool on a configured MCP server
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// List the resources a configured MCP server exposes
    Resources { server: String },

    /// Read a resource by URI
    Read { server: String, uri: String },

    /// Send a single prompt to the chat model
    Chat {
        prompt: String,
        /// Print the reply as it streams in
        #[arg(long)]
        stream: bool,
        /// System prompt
        #[arg(long)]
        system: Option<String>,
        /// Model to use
        #[arg(long)]
        model: Option<String>,
        /// Maximum tokens in the response
        #[arg(long)]
        max_tokens: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let (model, max_tokens) = match &cli.command {
        Command::Chat {
            model, max_tokens, ..
        } => (model.clone(), *max_tokens),
        _ => (None, None),
    };
    let config = ConduitConfig::load(CliOverrides {
        api_key: cli.api_key,
        model,
        max_tokens,
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    match cli.command {
        Command::Tools { server } => {
            let tools = with_server(&config, &server, |client| async move {
                client.list_tools().await
            })
            .await?;
            print_json(&tools)
        }
        Command::Call { server, tool, args } => {
            let arguments = parse_tool_args(&args)?;
            let result = with_server(&config, &server, |client| async move {
                client.call_tool(&tool, arguments).await
            })
            .await?;
            print_json(&result)?;
            if !result.is_success() {
                bail!("Tool call failed");
            }
            Ok(())
        }
        Command::Resources { server } => {
            let resources = with_server(&config, &server, |client| async move {
                client.list_resources().await
            })
            .await?;
            print_json(&resources)
        }
        Command::Read { server, uri } => {
            let contents = with_server(&config, &server, |client| async move {
                client.read_resource(&uri).await
            })
            .await?;
            print_json(&contents)
        }
        Command::Chat {
            prompt,
            stream,
            system,
            ..
        } => chat(&config, prompt, system, stream).await,
    }
}

/// Connect to a configured server, run one operation, disconnect.
async fn with_server<T, F, Fut>(config: &ConduitConfig, name: &str, op: F) -> Result<T>
where
    F: FnOnce(Arc<McpClient>) -> Fut,
    Fut: std::future::Future<Output = Result<T, conduit_mcp::McpError>>,
{
    let descriptor = config.server(name).map_err(|e| anyhow::anyhow!("{e}"))?;
    let client = Arc::new(McpClient::new(name));
    client
        .connect(descriptor)
        .await
        .with_context(|| format!("Failed to connect to MCP server '{name}'"))?;

    let result = op(Arc::clone(&client)).await;
    client.disconnect().await;
    Ok(result?)
}

fn parse_tool_args(raw: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("--args must be valid JSON")?;
    if !value.is_object() {
        bail!("--args must be a JSON object");
    }
    Ok(value)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    println!("{text}");
    Ok(())
}

async fn chat(
    config: &ConduitConfig,
    prompt: String,
    system: Option<String>,
    stream: bool,
) -> Result<()> {
    let credential = config
        .credential_provider()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let client = ChatClient::new(&config.api_base_url, Arc::new(credential))
        .context("Failed to create chat client")?;

    let mut request = ChatRequest::new(&config.model, config.max_tokens, vec![Message::user(prompt)]);
    if let Some(system) = system {
        request = request.with_system(system);
    }

    if !stream {
        let response = client
            .send(&request)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        println!("{}", response.text());
        print_usage(&response.usage);
        return Ok(());
    }

    // Ctrl+C ends the stream and closes the connection.
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut deltas = client
        .send_streaming_with_cancel(&request, cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut usage = Usage::default();
    let mut stdout = io::stdout();
    while let Some(delta) = deltas.next().await {
        let delta = delta.map_err(|e| anyhow::anyhow!("{e}"))?;
        if let Some(text) = &delta.text {
            write!(stdout, "{text}")?;
            stdout.flush()?;
        }
        if let Some(u) = &delta.usage {
            usage.add(u);
        }
    }
    println!();
    if cancel.is_cancelled() {
        eprintln!("[interrupted]");
    }
    print_usage(&usage);
    Ok(())
}

fn print_usage(usage: &Usage) {
    eprintln!(
        "[tokens: {} in, {} out]",
        usage.input_tokens, usage.output_tokens
    );
}
