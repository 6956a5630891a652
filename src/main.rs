use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use privacy_analyzer::config::{Cli, Config};
use privacy_analyzer::inference::engine::InferenceEngine;
use privacy_analyzer::server::analyze_api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "privacy_analyzer=debug,tower_http=debug"
    } else {
        "privacy_analyzer=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("privacy-analyzer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?.apply_cli(&cli);

    info!(
        model = config.model.model_id,
        revision = config.model.revision,
        max_new_tokens = config.generation.max_new_tokens,
        max_concurrent_requests = config.server.max_concurrent_requests,
        "Configuration loaded"
    );

    // Load the model before binding so no request ever sees an unloaded engine.
    let started = Instant::now();
    let load_config = config.clone();
    let engine = tokio::task::spawn_blocking(move || InferenceEngine::load(&load_config)).await??;

    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        sampling = ?engine.sampling(),
        "Inference engine ready"
    );

    // Build application state.
    let state = Arc::new(AppState::new(Arc::new(engine), &config));

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = &config.server.listen;
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
