//! Content-type definitions, cached by type name

use crate::db::documents;
use crate::models::Document;
use moka::future::Cache;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const CONTENT_TYPE: &str = "content-types";

/// Caches `content-types` documents, including misses. The coordinator
/// invalidates the whole cache whenever a pass writes a schema type.
#[derive(Clone)]
pub struct SchemaCache {
    cache: Cache<String, Option<Arc<Document>>>,
}

impl SchemaCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    /// Definition of `type_name`, loaded from the store on a miss
    pub async fn content_type(
        &self,
        pool: &Pool<Sqlite>,
        type_name: &str,
    ) -> Result<Option<Arc<Document>>, sqlx::Error> {
        if let Some(cached) = self.cache.get(type_name).await {
            debug!("Schema cache hit: {}", type_name);
            return Ok(cached);
        }

        let loaded = documents::get_document(pool, CONTENT_TYPE, type_name)
            .await?
            .map(Arc::new);
        self.cache.insert(type_name.to_string(), loaded.clone()).await;
        debug!("Schema cache loaded: {}", type_name);

        Ok(loaded)
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
        debug!("Schema cache invalidated");
    }
}
