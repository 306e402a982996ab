#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing, post};
use poem_mcpserver::{McpServer, streamable_http};
use shell_mcp::mcp::{Executor, McpShellCommands, ShellConfig, sse};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = ShellConfig::from_env()?;
    info!(
        "Starting {} in {} (default timeout: {:?})",
        config.shell, config.working_dir, config.default_hard_timeout
    );
    let executor = Arc::new(Executor::start(config).await?);

    // Setup MCP server
    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let tools = McpShellCommands::new(Arc::clone(&executor));
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| McpServer::new().tools(tools.clone())),
        )
        .at("/execute_stream", post(sse::execute_stream))
        .data(Arc::clone(&executor))
        .with(Tracing);

    info!("MCP Server with persistent shell support is ready");
    info!("Use the execute_bash tool to run commands");

    let result = Server::new(TcpListener::bind(mcp_addr))
        .name("Shell MCP Server")
        .run_with_graceful_shutdown(
            app,
            async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for shutdown signal: {}", err);
                }
                info!("Shutdown signal received");
            },
            None,
        )
        .await;

    executor.close().await;
    result?;

    Ok(())
}
