//! fieldgate: hardware I/O gateway.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use fieldgate_core::{Gateway, GatewayConfig};
use fieldgate_server::{HttpServer, ModbusServer, RegisterImage};

/// Hardware I/O gateway with REST, WebSocket and Modbus/TCP access.
#[derive(Parser, Debug)]
#[command(name = "fieldgate")]
#[command(about = "Expose field buses and their devices over REST, WebSocket and Modbus/TCP")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, default_value = "/etc/fieldgate/config.json5")]
    config: PathBuf,

    /// Log level (overrides config).
    #[arg(short, long)]
    log_level: Option<String>,

    /// HTTP port (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Modbus/TCP server port, 0 to disable (overrides config).
    #[arg(long)]
    modbus_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(port) = args.modbus_port {
        config.modbus_server.port = port;
    }
    config.logging = config.logging.with_level_override(args.log_level.as_deref());

    fieldgate_common::init_tracing(&config.logging)?;

    info!(config = %args.config.display(), "Starting fieldgate");

    let http_addr: SocketAddr = format!("{}:{}", config.http.address, config.http.port)
        .parse()
        .context("Invalid HTTP listen address")?;
    let modbus_addr: Option<SocketAddr> = if config.modbus_server.enabled() {
        let addr = format!("{}:{}", config.modbus_server.address, config.modbus_server.port)
            .parse()
            .context("Invalid Modbus listen address")?;
        Some(addr)
    } else {
        None
    };

    let gateway = Arc::new(Gateway::start(config).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if let Some(addr) = modbus_addr {
        let image = Arc::new(RegisterImage::new());
        image.seed(gateway.registry());
        gateway.set_modbus_context(image.clone());

        let server = ModbusServer::new(image, addr);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Modbus server error: {}", e);
            }
        }));
    }

    let http_server = HttpServer::new(Arc::clone(&gateway), http_addr);
    let http_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    }));

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    gateway.shutdown().await;

    shutdown_tx.send(true)?;
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await;

    info!("fieldgate stopped");
    Ok(())
}
