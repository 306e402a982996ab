#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use dotenv::dotenv;
use poem_mcpserver::McpServer;
use shell_mcp::mcp::{Executor, McpShellCommands, ShellConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // stdout carries the protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let executor = Arc::new(Executor::start(ShellConfig::from_env()?).await?);
    let result =
        poem_mcpserver::stdio::stdio(McpServer::new().tools(McpShellCommands::new(
            Arc::clone(&executor),
        )))
        .await;

    executor.close().await;
    result?;
    Ok(())
}
