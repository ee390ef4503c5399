use chain_hub_indexer::{
    api,
    blockchain::transport::HttpTransport,
    config::{self, Config},
    service::HubService,
};

use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting chain-hub-indexer");

    // Load configuration
    let config = Config::from_env();
    tracing::info!("Configuration loaded: {:?}", config);

    let data_sources = match &config.data_sources_file {
        Some(path) => config::load_data_sources(path).await?,
        None => {
            tracing::warn!("DATA_SOURCES_FILE not set, no data sources will be indexed");
            Vec::new()
        }
    };

    // Start indexing
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(config.rpc_timeout_secs))?);
    let mut service = HubService::start(config.clone(), data_sources, transport).await?;
    tracing::info!("Database connection established");
    service.start_live().await;

    // Start HTTP server
    let app = api::create_router(service.app_state()).layer(CorsLayer::permissive());
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Starting server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
