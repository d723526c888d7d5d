use std::sync::Arc;

use mcp_transport::{
    build_app,
    config::{Config, TransportMode},
    domain::tools::BuiltinTools,
    logging,
    stdio::StdioServer,
    AppState,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(run(config.clone()));
    // A blocked stdin read cannot be interrupted, so do not wait on it forever.
    runtime.shutdown_timeout(config.shutdown_timeout);
    result
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_for_shutdown(shutdown.clone()));

    let state = AppState::new(config.clone(), Arc::new(BuiltinTools::new()), shutdown.clone());

    match config.transport {
        TransportMode::Stdio => {
            info!(framing = ?config.stdio_framing, "server starting on stdio");
            StdioServer::new(
                Arc::clone(&state.dispatcher),
                state.registry.clone(),
                config.stdio_framing,
                config.shutdown_timeout,
            )
            .run(shutdown)
            .await?;
        }
        TransportMode::Http => {
            let bind_socket = config.bind_socket()?;
            let listener = tokio::net::TcpListener::bind(bind_socket).await?;

            info!(
                bind_addr = %config.bind_addr,
                bind_port = config.bind_port,
                mcp_path = %config.mcp_path,
                "server starting"
            );

            axum::serve(listener, build_app(state).into_make_service())
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await?;
        }
    }

    info!("server stopped");
    Ok(())
}

async fn watch_for_shutdown(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
