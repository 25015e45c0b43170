//! HTTP/WebSocket server command (`testforge serve`).

use anyhow::Result;
use testforge::config::Config;

pub async fn cmd_serve(config: &Config) -> Result<()> {
    testforge::pipeline::server::start_server(config).await
}
