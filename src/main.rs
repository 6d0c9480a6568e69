//! atmofed - federated access to ACTRIS, IAGOS and ICOS
//!
//! This is the main entry point for the atmofed server.

use std::net::SocketAddr;
use std::time::Instant;
use tokio::signal;
use tracing::{error, info};

use atmofed::handlers::{heartbeat, router};
use atmofed::{init_tracing, log_operation_end, log_operation_start, AppState, Config, FederationError, Result};

fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    init_tracing(&config.log_level);
    info!("Starting atmofed v{}", env!("CARGO_PKG_VERSION"));

    // Validate configuration
    config.validate().map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.server.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
    heartbeat::mark_start();

    let start = Instant::now();
    log_operation_start("federation_setup", Some(&format!("{:?}", config.enabled_adapters())));
    let state = AppState::from_config(config.clone()).map_err(|e| {
        error!("Failed to set up federation: {}", e);
        e
    })?;
    log_operation_end("federation_setup", start, true);

    info!(
        adapters = ?state.federation.registry().ris(),
        vocabulary = state.federation.vocabulary().version(),
        cache_enabled = state.federation.cache().is_enabled(),
        "Federation ready"
    );

    let app = router(state);

    // Create the server address
    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .map_err(|e| FederationError::Config {
                message: format!("Invalid host address: {}", e),
            })?,
        config.server.port,
    ));

    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| FederationError::Server {
            message: format!("Failed to bind to address: {}", e),
        })?;

    info!("Server is ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| FederationError::Server {
            message: format!("Server error: {}", e),
        })?;

    info!("Server has been gracefully shut down");
    Ok(())
}

/// Wait for a shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
