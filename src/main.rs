//! QuickIM server binary
//!
//! Usage:
//!   quickim server                     # listen on 0.0.0.0:9999
//!   quickim server --port 5000         # listen on a specific port
//!   RUST_LOG=quickim=debug quickim server

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use quickim::{ImServer, InMemoryCredentialStore, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "quickim", version, about = "QuickIM instant-messaging server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server
    Server(ServerArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to bind to
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Largest accepted frame payload in bytes
    #[arg(long)]
    max_frame_size: Option<usize>,

    /// Close connections idle for this many seconds
    #[arg(long)]
    idle_timeout: Option<u64>,
}

impl ServerArgs {
    /// Flags override whatever the environment set
    fn apply(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(ip) = self.bind {
            config.bind_addr.set_ip(ip);
        }
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(size) = self.max_frame_size {
            config.max_frame_size = size;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout = Duration::from_secs(secs);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quickim=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args.apply(ServerConfig::from_env())).await,
    }
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    info!("Starting QuickIM server");
    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Max connections: {}", config.max_connections);
    info!("  - Max frame size: {} bytes", config.max_frame_size);
    info!("  - Idle timeout: {:?}", config.idle_timeout);

    let store = Arc::new(InMemoryCredentialStore::new(config.bcrypt_cost));
    let server = ImServer::bind(config.clone(), store)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            return;
        }
        info!("Ctrl-C received, shutting down");
        shutdown.cancel();
    });

    server.run().await.context("server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "quickim",
            "server",
            "--bind",
            "127.0.0.1",
            "--port",
            "5000",
            "--idle-timeout",
            "30",
        ]);
        let Command::Server(args) = cli.command;
        let config = args.apply(ServerConfig::default());

        assert_eq!(config.bind_addr, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_connections, 10000);
    }
}
