//! Caching for derived schema lookups

pub mod schema;

pub use schema::SchemaCache;

use crate::config::Config;

pub fn init_schema_cache(config: &Config) -> SchemaCache {
    SchemaCache::new(config.schema_cache_capacity, config.schema_cache_ttl)
}
