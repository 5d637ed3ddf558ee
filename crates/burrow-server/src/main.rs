use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

use burrow_server::{
    authenticator_for, ControlPlane, PublicPlane, PublicRouter, ServerConfig, SessionRegistry,
    TlsFiles,
};

/// Tunnel broker - accepts client sessions and routes public traffic to them
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Self-hosted reverse tunnel broker")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,
}

fn tls_acceptor(files: Option<&TlsFiles>, listener: &str) -> Result<Option<TlsAcceptor>> {
    let Some(files) = files else {
        tracing::info!("{} listener TLS: disabled", listener);
        return Ok(None);
    };

    let acceptor = burrow_common::load_tls_acceptor(Path::new(&files.cert), Path::new(&files.key))
        .with_context(|| format!("Failed to load {} TLS configuration", listener))?;
    tracing::info!("{} listener TLS: {}", listener, files.cert);
    Ok(Some(acceptor))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("burrow_server=info".parse()?)
                .add_directive("burrow_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting burrow broker with config: {}", args.config);

    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    tracing::info!("Root domain: {}", config.root_domain);
    tracing::info!("Admin port: {}", config.admin_port);
    tracing::info!("Public ports: {:?}", config.public_ports);
    if config.auth_tokens.is_empty() {
        tracing::warn!("No auth tokens configured, any client may register an endpoint");
    }

    let admin_tls = tls_acceptor(config.admin_tls.as_ref(), "Admin")?;
    let public_tls = tls_acceptor(config.public_tls.as_ref(), "Public")?;

    // Shared state
    let registry = SessionRegistry::new();
    let router = PublicRouter::new(&config.root_domain, registry.clone());

    let control_plane = ControlPlane::new(
        registry.clone(),
        authenticator_for(&config.auth_tokens),
        admin_tls,
        config.control_settings(),
        config.session_settings(),
    );
    let public_plane = PublicPlane::new(router, public_tls, config.head_timeout);

    let admin_addr: SocketAddr = format!("0.0.0.0:{}", config.admin_port).parse()?;

    // One listener per public port, all routing through the same registry
    let mut public_listeners = JoinSet::new();
    for port in &config.public_ports {
        let public_addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        public_listeners.spawn(public_plane.clone().run(public_addr));
    }

    // Run both planes concurrently with graceful shutdown
    tokio::select! {
        result = control_plane.run(admin_addr) => {
            tracing::error!("Control plane stopped: {:?}", result);
        }
        Some(result) = public_listeners.join_next() => {
            tracing::error!("Public plane stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    public_listeners.abort_all();
    let closed = registry.shutdown();
    tracing::info!("Closed {} session(s)", closed);

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
