use crate::blockchain::client::ChainClientSettings;
use crate::blockchain::transport::RpcTransport;
use crate::config::DataSourceConfig;
use crate::indexing::error::IndexingError;
use crate::indexing::live::LiveUpdates;
use crate::indexing::operations::Operations;
use crate::indexing::IndexingSettings;
use crate::models::Hint;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Per-pass entry point of an indexer
#[async_trait]
pub trait Updater: Send {
    /// Index whatever changed since `meta` and return the meta to persist.
    /// Empty `hints` ask for a full reconciliation.
    async fn update_content(
        &mut self,
        meta: Option<Value>,
        hints: &[Hint],
        ops: &Operations,
    ) -> Result<Value, IndexingError>;
}

/// An activated data source
#[async_trait]
pub trait Indexer: Send + Sync {
    fn source_id(&self) -> &str;

    fn begin_update(&self) -> Box<dyn Updater>;

    /// Start live subscriptions that request passes through `live`
    async fn subscribe(&self, _live: LiveUpdates) -> Result<(), IndexingError> {
        Ok(())
    }

    /// Tear down live subscriptions
    async fn shutdown(&self) {}
}

/// What a factory needs to activate a data source
#[derive(Clone)]
pub struct IndexerContext {
    pub transport: Arc<dyn RpcTransport>,
    pub chain: ChainClientSettings,
    pub indexing: IndexingSettings,
}

/// Builds indexers for one source type
#[async_trait]
pub trait IndexerFactory: Send + Sync {
    fn source_type(&self) -> &'static str;

    async fn create(
        &self,
        config: &DataSourceConfig,
        context: &IndexerContext,
    ) -> Result<Arc<dyn Indexer>, IndexingError>;
}
