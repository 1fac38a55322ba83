//! Serve command - runs the relay until Ctrl+C.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use routetunnel::RelayServer;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Address to listen on (overrides `server.listen`)
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

pub async fn execute(args: &Args, config: &Config) -> Result<()> {
    let mut server_config = config.server_config();
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    server_config.validate().context("Invalid server configuration")?;

    if server_config.tunnels.is_empty() {
        warn!("No [[tunnels]] grants configured; every tunnel client will be rejected");
    }
    info!(
        "{} tunnel grant(s), {} user(s), forward timeout {:?}, keepalive {:?} x{}",
        server_config.tunnels.len(),
        server_config.users.len(),
        server_config.relay.forward_timeout(),
        server_config.relay.keepalive_interval(),
        server_config.relay.keepalive_grace,
    );

    let server = RelayServer::from_config(&server_config);
    server
        .bind_and_serve(server_config.listen, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down relay...");
        })
        .await
        .with_context(|| format!("Failed to serve on {}", server_config.listen))?;

    Ok(())
}
