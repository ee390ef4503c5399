//! Wires the store, data sources, coordinator and background tasks together.

use crate::api::state::AppState;
use crate::blockchain::client::ChainClientSettings;
use crate::blockchain::transport::RpcTransport;
use crate::cache::init_schema_cache;
use crate::config::{Config, DataSourceConfig};
use crate::db::connection::establish_connection;
use crate::indexing::bulk_writer::BulkWriteBuffer;
use crate::indexing::coordinator::{IndexingCoordinator, UpdateRequest};
use crate::indexing::live::{spawn_forwarder, LiveUpdates};
use crate::indexing::registry::{DataSourceRegistry, IndexerRegistry};
use crate::indexing::updater::IndexerContext;
use crate::indexing::IndexingSettings;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct HubService {
    config: Config,
    pool: Pool<Sqlite>,
    coordinator: Arc<IndexingCoordinator>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl HubService {
    pub async fn start(
        config: Config,
        data_sources: Vec<DataSourceConfig>,
        transport: Arc<dyn RpcTransport>,
    ) -> Result<Self, ServiceError> {
        let pool = establish_connection(&config.database_url).await?;
        Ok(Self::with_pool(config, pool, data_sources, transport).await)
    }

    /// Activate data sources against an existing store. Sources that fail to
    /// activate are logged and skipped.
    pub async fn with_pool(
        config: Config,
        pool: Pool<Sqlite>,
        data_sources: Vec<DataSourceConfig>,
        transport: Arc<dyn RpcTransport>,
    ) -> Self {
        let settings = IndexingSettings::from_config(&config);
        let buffer = Arc::new(BulkWriteBuffer::new(pool.clone(), settings.bulk_batch_size));
        let context = IndexerContext {
            transport,
            chain: ChainClientSettings::from_config(&config),
            indexing: settings.clone(),
        };

        let (sources, _failures) =
            DataSourceRegistry::activate(&data_sources, &IndexerRegistry::with_defaults(), &context).await;
        let coordinator = Arc::new(IndexingCoordinator::new(
            Arc::clone(&buffer),
            sources,
            init_schema_cache(&config),
        ));

        let token = CancellationToken::new();
        let flusher = buffer.spawn_periodic_flush(settings.flush_interval, token.child_token());

        Self {
            config,
            pool,
            coordinator,
            token,
            tasks: vec![flusher],
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn coordinator(&self) -> &Arc<IndexingCoordinator> {
        &self.coordinator
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            config: self.config.clone(),
            db_pool: self.pool.clone(),
            coordinator: Arc::clone(&self.coordinator),
            schema_cache: self.coordinator.schema_cache().clone(),
        })
    }

    /// Run an initial full pass, then subscribe every data source to the chain
    pub async fn start_live(&mut self) {
        if let Err(e) = self.coordinator.update(UpdateRequest::real_time()).await {
            error!("Initial indexing pass failed: {}", e);
        }

        let (live, receiver) = LiveUpdates::channel();
        self.tasks.push(spawn_forwarder(
            Arc::clone(&self.coordinator),
            receiver,
            self.token.child_token(),
        ));

        for session in self.coordinator.sources().sessions() {
            if let Err(e) = session.indexer.subscribe(live.clone()).await {
                error!("Data source {} failed to subscribe: {}", session.config.id, e);
            }
        }
        info!("Live indexing started");
    }

    /// Stop subscriptions, let queued passes finish, then flush and stop
    /// the background tasks
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        self.coordinator.wait_for_quiescence().await;

        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }
        info!("Service stopped");
    }
}
