//! Toolserve MCP - Entry Point
//!
//! Serves MCP over stdio; logs go to stderr as JSON.

use std::sync::Arc;
use toolserve_mcp::{McpServer, ServeConfig, Server};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Toolserve MCP Server v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: toolserve-mcp [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --help, -h         Show this help");
        println!();
        println!("Environment variables:");
        println!("  TOOLSERVE_CONFIG             TOML config file");
        println!("  TOOLSERVE_BACKENDS           Comma-separated backend endpoints");
        println!("  TOOLSERVE_ROUTING_STRATEGY   round-robin | least-connections | response-time | weighted");
        println!("  TOOLSERVE_CACHE_PATH         SQLite file for the persistent cache tier");
        println!("  RUST_LOG                     Log level (default: info)");
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    // stdout carries the protocol
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Toolserve MCP Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServeConfig::from_env()?;
    let server = Arc::new(Server::new(config)?);
    server.pre_warm();
    server.start_health_monitor();

    McpServer::new(server).run().await
}
