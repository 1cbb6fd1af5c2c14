use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use toolgate::config::load_config;
use toolgate::mcp_client::{
    CallOptions, McpClient, ServerRegistry, ToolInvoker, TransportKind,
};

#[derive(Parser)]
#[command(name = "toolgate", version, about = "Toolgate — invoke tools on MCP servers")]
struct Cli {
    /// Config file (defaults to $TOOLGATE_CONFIG or the nearest .toolgate/servers.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a tool and print its result as JSON
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,
        /// Free-text intent used to pick a scope on routing-capable servers
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Response size limit in bytes
        #[arg(long)]
        max_bytes: Option<usize>,
    },
    /// List registered servers
    Servers,
    /// Show the scope a context would be routed to
    Route { server: String, context: String },
}

fn build_client(config: Option<PathBuf>) -> anyhow::Result<McpClient> {
    match config {
        Some(path) => {
            let config = load_config(&path)
                .with_context(|| format!("loading config {}", path.display()))?;
            let mut registry = ServerRegistry::builtin()?;
            registry.merge(ServerRegistry::from_servers(config.servers)?);
            Ok(McpClient::builder()
                .with_registry(registry)
                .with_defaults(config.defaults)
                .build()?)
        }
        None => {
            let cwd = std::env::current_dir().context("reading current directory")?;
            Ok(McpClient::from_env(&cwd)?)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolgate::init_tracing().context("initializing logging")?;

    let cli = Cli::parse();
    let client = build_client(cli.config)?;

    match cli.command {
        Commands::Call {
            server,
            tool,
            params,
            context,
            timeout_ms,
            max_retries,
            max_bytes,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params is not valid JSON")?;
            let options = CallOptions {
                timeout_ms,
                max_retries,
                max_response_bytes: max_bytes,
                semantic_context: context,
                ..CallOptions::default()
            };
            let result = client.call_tool(&server, &tool, params, options).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Servers => {
            for descriptor in client.registry().descriptors() {
                let (kind, target) = match &descriptor.transport {
                    TransportKind::Ephemeral(c) => {
                        ("ephemeral", format!("{} {}", c.command, c.args.join(" ")))
                    }
                    TransportKind::Persistent(c) => ("persistent", c.url.clone()),
                };
                let routing = if descriptor.supports_routing() {
                    " [routing]"
                } else {
                    ""
                };
                println!(
                    "{:<12} {:<10} {:<11} {}{routing}",
                    descriptor.id,
                    kind,
                    format!("{:?}", descriptor.auth).to_lowercase(),
                    target.trim_end()
                );
            }
        }
        Commands::Route { server, context } => {
            client.registry().resolve(&server)?;
            let decision = client.route(&server, &context);
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
    }

    Ok(())
}
