use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use appscope_mcp_runtime::{McpCommands, run as run_mcp};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Parser)]
#[command(
    name = "appscope-mcp",
    version,
    about = "appscope MCP server: identity lookup and Kusto queries as tools"
)]
struct Cli {
    /// Log filter directives (tracing EnvFilter syntax)
    #[arg(
        long,
        env = "APPSCOPE_LOG",
        default_value = "appscope_mcp=info,appscope_mcp_runtime=info"
    )]
    log_filter: String,

    /// Log output format (always written to stderr)
    #[arg(long, env = "APPSCOPE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: McpCommands,
}

fn init_tracing(filter: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = matches!(format, LogFormat::Json);
    // stdout carries the MCP stream; logs go to stderr.
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log_filter, cli.log_format);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "appscope-mcp starting");

    let code = run_mcp(cli.command).await;
    std::process::exit(code);
}
