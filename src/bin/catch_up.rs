//! Runs one real-time indexing pass over every configured data source and
//! exits once the store has caught up.

use chain_hub_indexer::{
    blockchain::transport::HttpTransport,
    config::{self, Config},
    indexing::UpdateRequest,
    service::HubService,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let config = Config::from_env();
    let path = config
        .data_sources_file
        .clone()
        .ok_or("DATA_SOURCES_FILE must be set")?;
    let data_sources = config::load_data_sources(&path).await?;
    info!("Catching up {} data sources from {}", data_sources.len(), path);

    let transport = Arc::new(HttpTransport::new(Duration::from_secs(config.rpc_timeout_secs))?);
    let service = HubService::start(config, data_sources, transport).await?;

    let started = Instant::now();
    let result = service.coordinator().update(UpdateRequest::real_time()).await;
    service.coordinator().wait_for_quiescence().await;
    service.shutdown().await;

    match result {
        Ok(()) => {
            info!("Caught up in {:?}", started.elapsed());
            Ok(())
        }
        Err(e) => {
            error!("Catch-up failed: {}", e);
            Err(e.into())
        }
    }
}
