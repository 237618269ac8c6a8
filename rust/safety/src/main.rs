use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use safety::config::Config;
use safety::{SafetyServer, telemetry};

/// Mock microVM gRPC server
#[derive(Debug, Parser)]
#[command(name = "safety", version, about)]
struct Cli {
    /// Port number to start the server on
    #[arg(long)]
    port: Option<u16>,

    /// Host to bind
    #[arg(long)]
    host: Option<String>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init_tracing() {
        eprintln!("Failed to initialize tracing: {e}");
    }

    let mut config = Config::global().context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.enabled = true;
        config.metrics.port = port;
    }

    if config.metrics.enabled {
        let metrics_port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = safety::metrics::start_metrics_server(metrics_port).await {
                tracing::error!("Failed to start metrics server: {}", e);
            }
        });
    }

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to listen on {addr}"))?;

    info!(
        %addr,
        auth = !config.auth.token().is_empty(),
        "Starting mock microvm server"
    );

    SafetyServer::new()
        .serve(listener, config.auth.token(), async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Failed to serve gRPC")?;

    telemetry::shutdown_tracing();
    Ok(())
}
