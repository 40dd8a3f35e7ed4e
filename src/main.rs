use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tandemgate::config::Config;
use tandemgate::error::SupervisorError;
use tandemgate::process::ServiceRegistry;
use tandemgate::proxy::{PoolConfig, ReverseProxy};
use tandemgate::server::{GatewayRouter, GatewayServer};
use tandemgate::{PKG_NAME, VERSION};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tandemgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tandemgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = ServiceRegistry::new(config.resolve_all());

    for (name, result) in registry.start_all() {
        match result {
            Ok(()) => {}
            Err(SupervisorError::BinaryNotFound { name: binary, searched }) => {
                error!(
                    service = %name,
                    binary = %binary,
                    searched = ?searched,
                    "Service binary not found; install it into one of the searched locations or set `binary` to its path"
                );
            }
            Err(e) => {
                error!(service = %name, error = %e, "Failed to start service");
            }
        }
    }

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let proxy = Arc::new(ReverseProxy::new(pool_config));
    let router = Arc::new(GatewayRouter::new(Arc::clone(&registry), proxy));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port())
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port(), error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(bind_addr, router, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping all services...");
    registry.stop_all();

    if tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .is_err()
    {
        warn!("Gateway server did not stop within 5 seconds");
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        health_path = %config.defaults.health_path,
        poll_interval_ms = config.defaults.poll_interval_ms,
        max_attempts = config.defaults.max_attempts,
        probe_timeout_ms = config.defaults.probe_timeout_ms,
        request_timeout_secs = config.defaults.request_timeout_secs,
        "Readiness and request defaults"
    );
    let mut names: Vec<&String> = config.services.keys().collect();
    names.sort();
    info!(
        service_count = names.len(),
        services = ?names,
        "Configured services"
    );
}
