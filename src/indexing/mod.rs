//! The indexing engine: per-data-source indexers driven by the coordinator.

pub mod bulk_writer;
pub mod contracts;
pub mod coordinator;
pub mod error;
pub mod ethereum;
pub mod keyed;
pub mod live;
pub mod operations;
pub mod registry;
pub mod schema;
pub mod tracker;
pub mod transactions;
pub mod updater;

pub use bulk_writer::{BulkWriteBuffer, BulkWriteError};
pub use coordinator::{IndexingCoordinator, UpdateRequest};
pub use error::IndexingError;
pub use operations::Operations;
pub use registry::{DataSourceRegistry, IndexerRegistry};
pub use updater::{Indexer, IndexerContext, IndexerFactory, Updater};

use crate::config::Config;
use std::time::Duration;

/// Knobs shared by every indexer
#[derive(Debug, Clone)]
pub struct IndexingSettings {
    pub bulk_batch_size: usize,
    pub flush_interval: Duration,
    pub log_page_size: u64,
    pub backfill_page_size: u64,
    pub concurrency: usize,
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            bulk_batch_size: 100,
            flush_interval: Duration::from_secs(5),
            log_page_size: 5_000,
            backfill_page_size: 100,
            concurrency: 4,
        }
    }
}

impl IndexingSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bulk_batch_size: config.bulk_batch_size.max(1),
            flush_interval: config.flush_interval,
            log_page_size: config.log_page_size.max(1),
            backfill_page_size: config.backfill_page_size.max(1),
            concurrency: config.indexing_concurrency.max(1),
        }
    }
}
