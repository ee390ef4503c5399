// Service configuration:
// - database connection string and server address
// - RPC polling, timeout, rate limit and retry settings
// - bulk write and log pagination settings
// - schema cache settings (size, TTL)
// - the JSON file describing data sources

use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read data sources file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse data source configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No indexer registered for source type '{0}'")]
    UnknownSourceType(String),

    #[error("Invalid configuration for data source '{source_id}': {reason}")]
    Invalid { source_id: String, reason: String },
}

impl ConfigError {
    pub fn invalid(source_id: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub data_sources_file: Option<String>,
    pub poll_interval: Duration,
    pub rpc_timeout_secs: u64,
    pub rpc_rate_limit: Option<u32>,
    pub max_endpoint_cycles: usize,
    pub bulk_batch_size: usize,
    pub flush_interval: Duration,
    pub log_page_size: u64,
    pub max_logs_per_query: usize,
    pub backfill_page_size: u64,
    pub indexing_concurrency: usize,
    pub schema_cache_ttl: Duration,
    pub schema_cache_capacity: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://hub.db".to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            data_sources_file: None,
            poll_interval: Duration::from_secs(10),
            rpc_timeout_secs: 30,
            rpc_rate_limit: None,
            max_endpoint_cycles: 3,
            bulk_batch_size: 100,
            flush_interval: Duration::from_secs(5),
            log_page_size: 5_000,
            max_logs_per_query: 10_000,
            backfill_page_size: 100,
            indexing_concurrency: num_cpus::get(),
            schema_cache_ttl: Duration::from_secs(60),
            schema_cache_capacity: 1000,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();
        let defaults = Self::default();

        let database_url = env::var("DATABASE_URL").unwrap_or(defaults.database_url);
        let server_host = env::var("SERVER_HOST").unwrap_or(defaults.server_host);
        let server_port = parse_env("SERVER_PORT", defaults.server_port);
        let data_sources_file = env::var("DATA_SOURCES_FILE").ok();
        let poll_interval = Duration::from_secs(parse_env("POLL_INTERVAL_SECS", 10));
        let rpc_timeout_secs = parse_env("RPC_TIMEOUT_SECS", defaults.rpc_timeout_secs);
        let rpc_rate_limit = env::var("RPC_RATE_LIMIT").ok().and_then(|v| v.parse().ok());
        let max_endpoint_cycles = parse_env("MAX_ENDPOINT_CYCLES", defaults.max_endpoint_cycles);
        let bulk_batch_size = parse_env("BULK_BATCH_SIZE", defaults.bulk_batch_size);
        let flush_interval = Duration::from_secs(parse_env("FLUSH_INTERVAL_SECS", 5));
        let log_page_size = parse_env("LOG_PAGE_SIZE", defaults.log_page_size);
        let max_logs_per_query = parse_env("MAX_LOGS_PER_QUERY", defaults.max_logs_per_query);
        let backfill_page_size = parse_env("BACKFILL_PAGE_SIZE", defaults.backfill_page_size);
        let indexing_concurrency = parse_env("INDEXING_CONCURRENCY", defaults.indexing_concurrency);
        let schema_cache_ttl = Duration::from_secs(parse_env("SCHEMA_CACHE_TTL", 60));
        let schema_cache_capacity = parse_env("SCHEMA_CACHE_CAPACITY", defaults.schema_cache_capacity);

        Self {
            database_url,
            server_host,
            server_port,
            data_sources_file,
            poll_interval,
            rpc_timeout_secs,
            rpc_rate_limit,
            max_endpoint_cycles,
            bulk_batch_size,
            flush_interval,
            log_page_size,
            max_logs_per_query,
            backfill_page_size,
            indexing_concurrency,
            schema_cache_ttl,
            schema_cache_capacity,
        }
    }
}

/// One entry of the data sources file. `params` is interpreted by the
/// indexer registered for `source_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConfig {
    pub id: String,
    pub source_type: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumSourceParams {
    pub json_rpc_urls: Vec<String>,
    #[serde(default)]
    pub contract: Option<ContractConfig>,
    #[serde(default)]
    pub address_indexing: Option<AddressIndexingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractConfig {
    pub abi: Value,
    pub address: String,
    /// Event name -> content types refreshed when the event fires
    #[serde(default)]
    pub event_content_triggers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub indexing_skip_indicators: Vec<String>,
    #[serde(default)]
    pub start_block: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressIndexingConfig {
    pub tracked_address_content_type: String,
    pub tracked_address_field: String,
    #[serde(default)]
    pub max_addresses_tracked: Option<usize>,
    #[serde(default)]
    pub start_block: Option<u64>,
}

impl EthereumSourceParams {
    pub fn from_config(config: &DataSourceConfig) -> Result<Self, ConfigError> {
        let params: Self = serde_json::from_value(config.params.clone())
            .map_err(|e| ConfigError::invalid(&config.id, e.to_string()))?;

        if params.json_rpc_urls.is_empty() {
            return Err(ConfigError::invalid(&config.id, "jsonRpcUrls must not be empty"));
        }
        if params.contract.is_none() && params.address_indexing.is_none() {
            return Err(ConfigError::invalid(
                &config.id,
                "either contract or addressIndexing must be configured",
            ));
        }
        if let Some(indexing) = &params.address_indexing {
            if indexing.tracked_address_content_type.is_empty() || indexing.tracked_address_field.is_empty() {
                return Err(ConfigError::invalid(
                    &config.id,
                    "addressIndexing needs trackedAddressContentType and trackedAddressField",
                ));
            }
        }

        Ok(params)
    }
}

pub fn parse_data_sources(json: &str) -> Result<Vec<DataSourceConfig>, ConfigError> {
    Ok(serde_json::from_str(json)?)
}

pub async fn load_data_sources(path: impl AsRef<Path>) -> Result<Vec<DataSourceConfig>, ConfigError> {
    let path = path.as_ref();
    let json = tokio::fs::read_to_string(path).await.map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_data_sources(&json)
}
