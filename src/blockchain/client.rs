use crate::blockchain::models::{Block, BlockId, Log, LogFilter, Receipt, Transaction};
use crate::blockchain::subscription::Subscriptions;
use crate::blockchain::transport::RpcTransport;
use crate::config::Config;
use alloy_primitives::{Address, Bytes, B256, U256, U64};
use backon::{ExponentialBuilder, Retryable};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Messages providers use when an `eth_getLogs` range or result set is too big
const RANGE_LIMIT_MESSAGES: &[&str] = &[
    "query returned more than",
    "block range",
    "range is too large",
    "range too large",
    "response size",
    "too many results",
    "too many logs",
];

fn is_rate_limited(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("rate limit") || message.contains("request rate") || message.contains("too many requests")
}

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("All RPC endpoints unavailable ({attempts} tried): {reason}")]
    Unavailable { attempts: usize, reason: String },

    #[error("Log range {from}-{to} still rejected after {halvings} halvings")]
    RangeTooLarge { from: u64, to: u64, halvings: u32 },

    #[error("Log query for block {block} returned {count} logs, the per-query limit; results may be truncated")]
    PossiblyTruncated { block: u64, count: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid RPC response: {0}")]
    Decode(String),

    #[error("No RPC endpoints configured")]
    NoEndpoints,
}

impl ChainError {
    /// Errors worth another cycle through the endpoint list
    pub fn is_retryable(&self) -> bool {
        match self {
            ChainError::Connection { .. } | ChainError::Unavailable { .. } => true,
            ChainError::Rpc { message, .. } => is_rate_limited(message),
            _ => false,
        }
    }

    /// Provider rejected a log query because the range or result set was too
    /// big. Rate limiting is not a size limit and is left to backoff.
    pub fn is_range_limit(&self) -> bool {
        match self {
            ChainError::Rpc { message, .. } => {
                let message = message.to_lowercase();
                !is_rate_limited(&message)
                    && RANGE_LIMIT_MESSAGES
                        .iter()
                        .any(|known| message.contains(known))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainClientSettings {
    pub rate_limit: Option<u32>,
    pub max_endpoint_cycles: usize,
    pub retry_min_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_log_range_halvings: u32,
    pub max_logs_per_query: usize,
    pub poll_interval: Duration,
}

impl Default for ChainClientSettings {
    fn default() -> Self {
        Self {
            rate_limit: None,
            max_endpoint_cycles: 3,
            retry_min_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(10),
            max_log_range_halvings: 20,
            max_logs_per_query: 10_000,
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl ChainClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rate_limit: config.rpc_rate_limit,
            max_endpoint_cycles: config.max_endpoint_cycles,
            max_logs_per_query: config.max_logs_per_query,
            poll_interval: config.poll_interval,
            ..Self::default()
        }
    }
}

/// Ethereum JSON-RPC client over an ordered list of endpoints.
///
/// Requests go to the active endpoint; a connection failure falls through to
/// the next URL in the list. A full cycle without success is retried with
/// exponential backoff up to `max_endpoint_cycles` before surfacing
/// [`ChainError::Unavailable`].
pub struct ChainClient {
    endpoints: Vec<String>,
    active: AtomicUsize,
    transport: Arc<dyn RpcTransport>,
    limiter: Option<DefaultDirectRateLimiter>,
    settings: ChainClientSettings,
    pub(crate) subscriptions: Subscriptions,
}

impl ChainClient {
    /// Try the endpoints in order and keep the first one that answers
    pub async fn connect(
        endpoints: Vec<String>,
        transport: Arc<dyn RpcTransport>,
        settings: ChainClientSettings,
    ) -> Result<Self, ChainError> {
        if endpoints.is_empty() {
            return Err(ChainError::NoEndpoints);
        }

        let mut last_error = String::new();
        let mut connected = None;

        for (index, endpoint) in endpoints.iter().enumerate() {
            match transport.send(endpoint, "eth_chainId", json!([])).await {
                Ok(_) => {
                    info!("Connected to RPC endpoint {}", endpoint);
                    connected = Some(index);
                    break;
                }
                Err(e) => {
                    warn!("RPC endpoint {} unreachable at connect: {}", endpoint, e);
                    last_error = e.to_string();
                }
            }
        }

        let active = connected.ok_or_else(|| ChainError::Unavailable {
            attempts: endpoints.len(),
            reason: last_error,
        })?;

        let limiter = settings
            .rate_limit
            .and_then(NonZeroU32::new)
            .map(|per_second| RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            endpoints,
            active: AtomicUsize::new(active),
            transport,
            limiter,
            settings,
            subscriptions: Subscriptions::default(),
        })
    }

    pub fn settings(&self) -> &ChainClientSettings {
        &self.settings
    }

    pub fn active_endpoint(&self) -> &str {
        &self.endpoints[self.active.load(Ordering::Relaxed) % self.endpoints.len()]
    }

    /// Raw JSON-RPC request with endpoint rotation and retry
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.retry_min_delay)
            .with_max_delay(self.settings.retry_max_delay)
            .with_max_times(self.settings.max_endpoint_cycles.saturating_sub(1));

        (|| self.cycle_endpoints(method, &params))
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(ChainError::is_retryable)
            .notify(|err: &ChainError, delay: Duration| {
                warn!("RPC {} failed, retrying in {:?}: {}", method, delay, err);
            })
            .await
    }

    async fn cycle_endpoints(&self, method: &str, params: &Value) -> Result<Value, ChainError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let count = self.endpoints.len();
        let start = self.active.load(Ordering::Relaxed);
        let mut last_error = String::new();

        for offset in 0..count {
            let index = (start + offset) % count;
            let endpoint = &self.endpoints[index];

            match self.transport.send(endpoint, method, params.clone()).await {
                Ok(value) => {
                    if index != start % count {
                        self.active.store(index, Ordering::Relaxed);
                        info!("Switched RPC endpoint to {}", endpoint);
                    }
                    return Ok(value);
                }
                Err(ChainError::Connection { endpoint, reason }) => {
                    warn!("RPC endpoint {} failed for {}: {}", endpoint, method, reason);
                    last_error = format!("{}: {}", endpoint, reason);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ChainError::Unavailable {
            attempts: count,
            reason: last_error,
        })
    }

    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        let id: U64 = decode(self.request("eth_chainId", json!([])).await?)?;
        Ok(id.to::<u64>())
    }

    pub async fn current_block_height(&self) -> Result<u64, ChainError> {
        let height: U64 = decode(self.request("eth_blockNumber", json!([])).await?)?;
        Ok(height.to::<u64>())
    }

    /// Block with full transaction objects
    pub async fn get_block(&self, id: BlockId) -> Result<Block, ChainError> {
        let value = match id {
            BlockId::Hash(_) => {
                self.request("eth_getBlockByHash", json!([id.to_param(), true]))
                    .await?
            }
            _ => {
                self.request("eth_getBlockByNumber", json!([id.to_param(), true]))
                    .await?
            }
        };

        decode::<Option<Block>>(value)?
            .ok_or_else(|| ChainError::NotFound(format!("block {:?}", id)))
    }

    pub async fn get_transaction(&self, hash: B256) -> Result<Transaction, ChainError> {
        let value = self
            .request("eth_getTransactionByHash", json!([hash]))
            .await?;
        decode::<Option<Transaction>>(value)?
            .ok_or_else(|| ChainError::NotFound(format!("transaction {}", hash)))
    }

    pub async fn get_transaction_receipt(&self, hash: B256) -> Result<Receipt, ChainError> {
        let value = self
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        decode::<Option<Receipt>>(value)?
            .ok_or_else(|| ChainError::NotFound(format!("receipt {}", hash)))
    }

    pub async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        let value = self
            .request("eth_getBalance", json!([address, "latest"]))
            .await?;
        decode(value)
    }

    /// `eth_call` against the latest block
    pub async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        let value = self
            .request("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        decode(value)
    }

    /// Logs for `from_block..=to_block` in chain order.
    ///
    /// Ranges the provider rejects as too large, and pages that come back with
    /// exactly `max_logs_per_query` entries, are split in half and retried.
    pub async fn get_past_logs(
        &self,
        from_block: u64,
        to_block: u64,
        filter: &LogFilter,
    ) -> Result<Vec<Log>, ChainError> {
        let limit = self.settings.max_logs_per_query;
        let max_halvings = self.settings.max_log_range_halvings;

        let mut logs = Vec::new();
        let mut pending = VecDeque::from([(from_block, to_block, 0u32)]);

        while let Some((from, to, halvings)) = pending.pop_front() {
            if from > to {
                continue;
            }

            match self
                .request("eth_getLogs", json!([filter.to_param(from, to)]))
                .await
            {
                Ok(value) => {
                    let page: Vec<Log> = decode(value)?;
                    if limit == 0 || page.len() < limit {
                        logs.extend(page);
                        continue;
                    }
                    if from == to {
                        return Err(ChainError::PossiblyTruncated {
                            block: from,
                            count: page.len(),
                        });
                    }
                    debug!(
                        "Log query {}-{} hit the {} result limit, splitting",
                        from, to, limit
                    );
                }
                Err(e) if e.is_range_limit() && from < to => {
                    debug!("Log query {}-{} rejected ({}), splitting", from, to, e);
                }
                Err(e) => return Err(e),
            }

            if halvings >= max_halvings {
                return Err(ChainError::RangeTooLarge { from, to, halvings });
            }

            // Lower half first so results stay in chain order
            let mid = from + (to - from) / 2;
            pending.push_front((mid + 1, to, halvings + 1));
            pending.push_front((from, mid, halvings + 1));
        }

        logs.retain(|log| !log.removed);
        Ok(logs)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ChainError> {
    serde_json::from_value(value).map_err(|e| ChainError::Decode(e.to_string()))
}
