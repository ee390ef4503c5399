use crate::cache::SchemaCache;
use crate::config::Config;
use crate::indexing::IndexingCoordinator;
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub db_pool: SqlitePool,
    pub coordinator: Arc<IndexingCoordinator>,
    pub schema_cache: SchemaCache,
}
