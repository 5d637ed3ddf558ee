use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use burrow::{ClientConfig, LocalForwarder, ServerConnector, TunnelClient};

/// Burrow - expose a local service on a public subdomain
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Expose local services through a burrow broker")]
struct Cli {
    /// Optional TOML config file; command-line options take precedence
    #[arg(short, long)]
    config: Option<String>,

    /// Broker admin address (host:port)
    #[arg(short, long, env = "BURROW_SERVER")]
    server: Option<String>,

    /// Local address to forward to (e.g., 127.0.0.1:3000)
    #[arg(short, long)]
    local: Option<String>,

    /// Requested endpoint id (optional, assigned by the server if not specified)
    #[arg(long)]
    endpoint: Option<String>,

    /// Auth token
    #[arg(long, env = "BURROW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// CA certificate file; connects with TLS when given
    #[arg(long)]
    ca: Option<String>,

    /// TLS server name override
    #[arg(long)]
    server_name: Option<String>,

    /// Seconds between keepalive pings (0 disables)
    #[arg(long)]
    keepalive: Option<u64>,
}

impl Cli {
    /// Merge command-line options over the config file
    fn resolve(self) -> Result<ClientConfig> {
        let file = match &self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };

        Ok(ClientConfig {
            server_addr: self.server.or(file.server_addr),
            local_addr: self.local.or(file.local_addr),
            endpoint_id: self.endpoint.or(file.endpoint_id),
            token: self.token.or(file.token),
            ca_cert: self.ca.or(file.ca_cert),
            server_name: self.server_name.or(file.server_name),
            keepalive_secs: self.keepalive.or(file.keepalive_secs),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("burrow=info".parse()?)
                .add_directive("burrow_common=info".parse()?),
        )
        .init();

    let config = Cli::parse().resolve()?;

    let server_addr = config
        .server_addr
        .clone()
        .context("Server address required. Use --server or server_addr in config")?;
    let local_addr = config
        .local_addr
        .clone()
        .context("Local address required. Use --local (e.g., --local 127.0.0.1:3000)")?;

    let connector = match &config.ca_cert {
        Some(ca_path) => {
            let ca_pem = std::fs::read_to_string(ca_path)
                .with_context(|| format!("Failed to read CA certificate {}", ca_path))?;
            ServerConnector::tls(&server_addr, &ca_pem, config.server_name.as_deref())?
        }
        None => ServerConnector::plain(&server_addr),
    };

    let keepalive = match config.keepalive_secs.unwrap_or(30) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
            }
            shutdown.cancel();
        });
    }

    // Reconnection loop
    while !shutdown.is_cancelled() {
        tracing::info!("Connecting to {} to expose {}", server_addr, local_addr);

        let result = async {
            let client = TunnelClient::connect(&connector, config.auth_params()).await?;
            tracing::info!(
                "Endpoint {} -> {}",
                client.endpoint_id(),
                local_addr
            );
            let forwarder =
                LocalForwarder::new(connector.clone(), client.endpoint_id(), local_addr.clone());
            client.run(forwarder, keepalive, shutdown.clone()).await
        }
        .await;

        match result {
            Ok(()) if shutdown.is_cancelled() => break,
            Ok(()) => tracing::warn!("Session ended by server"),
            Err(e) => tracing::error!("Tunnel error: {:#}", e),
        }

        tracing::info!("Reconnecting in 5 seconds...");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            _ = shutdown.cancelled() => {}
        }
    }

    tracing::info!("Client shutdown complete");
    Ok(())
}
