use crate::config::{ConfigError, DataSourceConfig};
use crate::indexing::error::IndexingError;
use crate::indexing::ethereum::EthereumIndexerFactory;
use crate::indexing::updater::{Indexer, IndexerContext, IndexerFactory};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info};

/// Indexer factories by source type, resolved once at startup
#[derive(Default, Clone)]
pub struct IndexerRegistry {
    factories: HashMap<&'static str, Arc<dyn IndexerFactory>>,
}

impl IndexerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in source type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EthereumIndexerFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn IndexerFactory>) {
        self.factories.insert(factory.source_type(), factory);
    }

    pub fn resolve(&self, source_type: &str) -> Result<Arc<dyn IndexerFactory>, ConfigError> {
        self.factories
            .get(source_type)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownSourceType(source_type.to_string()))
    }
}

/// An activated data source and the indexer serving it
#[derive(Clone)]
pub struct DataSourceSession {
    pub config: DataSourceConfig,
    pub indexer: Arc<dyn Indexer>,
}

/// The data sources a coordinator drives, keyed by id
#[derive(Default, Clone)]
pub struct DataSourceRegistry {
    sessions: BTreeMap<String, DataSourceSession>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate every configured data source. A source that fails to
    /// activate is logged and left out; the others still start.
    pub async fn activate(
        configs: &[DataSourceConfig],
        factories: &IndexerRegistry,
        context: &IndexerContext,
    ) -> (Self, Vec<(String, IndexingError)>) {
        let mut registry = Self::new();
        let mut failures = Vec::new();

        for config in configs {
            let created = match factories.resolve(&config.source_type) {
                Ok(factory) => factory.create(config, context).await,
                Err(e) => Err(e.into()),
            };

            match created {
                Ok(indexer) => registry.insert(config.clone(), indexer),
                Err(e) => {
                    error!("Data source {} failed to activate: {}", config.id, e);
                    failures.push((config.id.clone(), e));
                }
            }
        }

        info!(
            "Activated {} of {} data sources",
            registry.len(),
            configs.len()
        );
        (registry, failures)
    }

    pub fn insert(&mut self, config: DataSourceConfig, indexer: Arc<dyn Indexer>) {
        self.sessions.insert(
            config.id.clone(),
            DataSourceSession { config, indexer },
        );
    }

    pub fn get(&self, source_id: &str) -> Option<&DataSourceSession> {
        self.sessions.get(source_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &DataSourceSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
