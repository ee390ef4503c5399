//! In-memory chain, store and harness shared by the integration tests.

use crate::blockchain::abi::{address_id, ContractAbi};
use crate::blockchain::client::{ChainClient, ChainClientSettings, ChainError};
use crate::blockchain::models::{Block, Log, Receipt, Transaction};
use crate::blockchain::transport::RpcTransport;
use crate::cache::SchemaCache;
use crate::config::DataSourceConfig;
use crate::db::{connection, documents};
use crate::indexing::bulk_writer::BulkWriteBuffer;
use crate::indexing::coordinator::{IndexingCoordinator, PassResult, UpdateRequest};
use crate::indexing::ethereum::EthereumIndexer;
use crate::indexing::registry::DataSourceRegistry;
use crate::indexing::error::IndexingError;
use crate::indexing::operations::Operations;
use crate::indexing::updater::{Indexer, IndexerContext, Updater};
use crate::indexing::IndexingSettings;
use crate::models::{Document, Hint};
use alloy_dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::{Pool, Sqlite};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const PRIMARY: &str = "http://primary.rpc.test";
pub const BACKUP: &str = "http://backup.rpc.test";

pub const WALLET_TYPE: &str = "tracked-wallets";
pub const WALLET_FIELD: &str = "wallet-address";

pub fn alice() -> Address {
    Address::repeat_byte(0xa1)
}

pub fn bob() -> Address {
    Address::repeat_byte(0xb2)
}

pub fn carol() -> Address {
    Address::repeat_byte(0xc3)
}

pub fn dave() -> Address {
    Address::repeat_byte(0xd4)
}

pub fn token_address() -> Address {
    Address::repeat_byte(0x70)
}

pub fn token_owner() -> Address {
    Address::repeat_byte(0x0f)
}

pub fn id_of(address: &Address) -> String {
    address_id(address)
}

pub fn token_abi_json() -> Value {
    json!([
        {"type": "function", "name": "name", "stateMutability": "view",
         "inputs": [], "outputs": [{"name": "", "type": "string"}]},
        {"type": "function", "name": "totalSupply", "stateMutability": "view",
         "inputs": [], "outputs": [{"name": "", "type": "uint256"}]},
        {"type": "function", "name": "tokenFrozen", "stateMutability": "view",
         "inputs": [], "outputs": [{"name": "", "type": "bool"}]},
        {"type": "function", "name": "balanceOf", "stateMutability": "view",
         "inputs": [{"name": "owner", "type": "address"}],
         "outputs": [{"name": "", "type": "uint256"}]},
        {"type": "function", "name": "buyer", "stateMutability": "view",
         "inputs": [{"name": "account", "type": "address"}],
         "outputs": [{"name": "approved", "type": "bool"}, {"name": "limit", "type": "uint256"}]},
        {"type": "function", "name": "transfer", "stateMutability": "nonpayable",
         "inputs": [{"name": "to", "type": "address"}, {"name": "value", "type": "uint256"}],
         "outputs": [{"name": "", "type": "bool"}]},
        {"type": "event", "name": "Mint", "anonymous": false, "inputs": [
            {"name": "to", "type": "address", "indexed": true},
            {"name": "amount", "type": "uint256", "indexed": false}]},
        {"type": "event", "name": "Transfer", "anonymous": false, "inputs": [
            {"name": "from", "type": "address", "indexed": true},
            {"name": "to", "type": "address", "indexed": true},
            {"name": "value", "type": "uint256", "indexed": false}]},
        {"type": "event", "name": "BuyerApproved", "anonymous": false, "inputs": [
            {"name": "buyer", "type": "address", "indexed": true}]},
        {"type": "event", "name": "BuyerLimitSet", "anonymous": false, "inputs": [
            {"name": "buyer", "type": "address", "indexed": true},
            {"name": "limit", "type": "uint256", "indexed": false}]}
    ])
}

#[derive(Default)]
struct TokenState {
    total_supply: U256,
    balances: HashMap<Address, U256>,
    buyers: HashMap<Address, (bool, U256)>,
    frozen: bool,
    total_supply_reverts: bool,
}

#[derive(Default)]
struct ChainState {
    blocks: Vec<Block>,
    receipts: HashMap<B256, Receipt>,
    balances: HashMap<Address, U256>,
    logs: Vec<Log>,
    token: TokenState,
    tx_counter: u64,
}

struct PendingTx {
    from: Address,
    to: Option<Address>,
    value: U256,
    logs: Vec<(Vec<B256>, Bytes)>,
}

/// A deterministic chain behind the [`RpcTransport`] seam, hosting one
/// sample token contract at [`token_address`].
pub struct MockChain {
    state: Mutex<ChainState>,
    abi: ContractAbi,
    down: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
    served_by: Mutex<Vec<String>>,
    max_log_span: Mutex<Option<u64>>,
}

impl MockChain {
    /// A chain holding only the genesis block
    pub fn new() -> Arc<Self> {
        let chain = Self {
            state: Mutex::new(ChainState::default()),
            abi: ContractAbi::from_json(&token_abi_json()).expect("sample token ABI"),
            down: Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            served_by: Mutex::new(Vec::new()),
            max_log_span: Mutex::new(None),
        };
        chain.mine_with(Vec::new());
        Arc::new(chain)
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().blocks.len() as u64 - 1
    }

    pub fn set_down(&self, endpoint: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Number of requests received for `method`, on any endpoint
    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    pub fn last_served_by(&self) -> Option<String> {
        self.served_by.lock().unwrap().last().cloned()
    }

    /// Reject `eth_getLogs` spanning more than `blocks` blocks
    pub fn limit_log_span(&self, blocks: u64) {
        *self.max_log_span.lock().unwrap() = Some(blocks);
    }

    pub fn balance(&self, address: &Address) -> U256 {
        self.state.lock().unwrap().balances.get(address).copied().unwrap_or_default()
    }

    pub fn set_balance(&self, address: Address, wei: u64) {
        self.state.lock().unwrap().balances.insert(address, U256::from(wei));
    }

    /// Transaction hashes of `block`, in block order
    pub fn transaction_hashes(&self, block: u64) -> Vec<String> {
        self.state.lock().unwrap().blocks[block as usize]
            .transactions
            .iter()
            .map(|tx| tx.hash.to_string())
            .collect()
    }

    /// Mine one block holding a plain value transfer per entry
    pub fn mine(&self, transfers: &[(Address, Address, u64)]) -> u64 {
        self.mine_with(
            transfers
                .iter()
                .map(|(from, to, value)| PendingTx {
                    from: *from,
                    to: Some(*to),
                    value: U256::from(*value),
                    logs: Vec::new(),
                })
                .collect(),
        )
    }

    pub fn mine_empty(&self, count: usize) -> u64 {
        for _ in 0..count {
            self.mine_with(Vec::new());
        }
        self.head()
    }

    fn mine_with(&self, pending: Vec<PendingTx>) -> u64 {
        let mut state = self.state.lock().unwrap();
        let number = state.blocks.len() as u64;
        let block_hash = keccak256(format!("block-{}", number));

        let mut transactions = Vec::with_capacity(pending.len());
        let mut log_index = 0u64;

        for (index, ptx) in pending.into_iter().enumerate() {
            state.tx_counter += 1;
            let hash = keccak256(format!("tx-{}", state.tx_counter));

            let tx = Transaction {
                hash,
                nonce: state.tx_counter,
                block_hash: Some(block_hash),
                block_number: Some(number),
                transaction_index: Some(index as u64),
                from: ptx.from,
                to: ptx.to,
                value: ptx.value,
                gas: 21_000,
                gas_price: Some(U256::from(1_000_000_000u64)),
                input: Bytes::new(),
            };

            state.receipts.insert(
                hash,
                Receipt {
                    transaction_hash: hash,
                    block_number: Some(number),
                    status: Some(U64::from(1)),
                    gas_used: 21_000,
                    cumulative_gas_used: 21_000 * (index as u64 + 1),
                },
            );

            for (topics, data) in ptx.logs {
                state.logs.push(Log {
                    address: token_address(),
                    topics,
                    data,
                    block_number: Some(number),
                    transaction_hash: Some(hash),
                    transaction_index: Some(index as u64),
                    log_index: Some(log_index),
                    removed: false,
                });
                log_index += 1;
            }

            if !ptx.value.is_zero() {
                let from_balance = state.balances.get(&ptx.from).copied().unwrap_or_default();
                state.balances.insert(ptx.from, from_balance.saturating_sub(ptx.value));
                if let Some(to) = ptx.to {
                    let to_balance = state.balances.get(&to).copied().unwrap_or_default();
                    state.balances.insert(to, to_balance + ptx.value);
                }
            }

            transactions.push(tx);
        }

        state.blocks.push(Block {
            number,
            hash: block_hash,
            timestamp: 1_700_000_000 + number * 12,
            transactions,
        });
        number
    }

    fn token_call(&self, from: Address, topics: Vec<B256>, body: Vec<DynSolValue>) -> u64 {
        let data = Bytes::from(DynSolValue::Tuple(body).abi_encode_params());
        self.mine_with(vec![PendingTx {
            from,
            to: Some(token_address()),
            value: U256::ZERO,
            logs: vec![(topics, data)],
        }])
    }

    fn selector(&self, event: &str) -> B256 {
        self.abi.event(event).expect("sample token event").selector()
    }

    pub fn mint(&self, to: Address, amount: u64) -> u64 {
        {
            let mut state = self.state.lock().unwrap();
            let token = &mut state.token;
            token.total_supply += U256::from(amount);
            *token.balances.entry(to).or_default() += U256::from(amount);
        }
        self.token_call(
            token_owner(),
            vec![self.selector("Mint"), to.into_word()],
            vec![DynSolValue::Uint(U256::from(amount), 256)],
        )
    }

    pub fn transfer(&self, from: Address, to: Address, amount: u64) -> u64 {
        {
            let mut state = self.state.lock().unwrap();
            let token = &mut state.token;
            let from_balance = token.balances.get(&from).copied().unwrap_or_default();
            token.balances.insert(from, from_balance.saturating_sub(U256::from(amount)));
            *token.balances.entry(to).or_default() += U256::from(amount);
        }
        self.token_call(
            from,
            vec![self.selector("Transfer"), from.into_word(), to.into_word()],
            vec![DynSolValue::Uint(U256::from(amount), 256)],
        )
    }

    pub fn approve_buyer(&self, buyer: Address) -> u64 {
        self.state.lock().unwrap().token.buyers.entry(buyer).or_default().0 = true;
        self.token_call(
            token_owner(),
            vec![self.selector("BuyerApproved"), buyer.into_word()],
            Vec::new(),
        )
    }

    pub fn set_buyer_limit(&self, buyer: Address, limit: u64) -> u64 {
        self.state.lock().unwrap().token.buyers.entry(buyer).or_default().1 = U256::from(limit);
        self.token_call(
            token_owner(),
            vec![self.selector("BuyerLimitSet"), buyer.into_word()],
            vec![DynSolValue::Uint(U256::from(limit), 256)],
        )
    }

    /// Contract state changes that emit no event
    pub fn set_frozen(&self, frozen: bool) {
        self.state.lock().unwrap().token.frozen = frozen;
    }

    pub fn set_token_balance(&self, owner: Address, amount: u64) {
        self.state.lock().unwrap().token.balances.insert(owner, U256::from(amount));
    }

    pub fn set_total_supply_reverts(&self, reverts: bool) {
        self.state.lock().unwrap().token.total_supply_reverts = reverts;
    }

    fn dispatch(&self, method: &str, params: &Value) -> Result<Value, ChainError> {
        let state = self.state.lock().unwrap();
        match method {
            "eth_chainId" => Ok(json!("0x539")),
            "eth_blockNumber" => Ok(json!(format!("{:#x}", state.blocks.len() - 1))),
            "eth_getBlockByNumber" => {
                let number = match params[0].as_str() {
                    Some("latest") => state.blocks.len() as u64 - 1,
                    Some(hex) => parse_quantity(hex)?,
                    None => return Err(bad_params(method)),
                };
                Ok(state
                    .blocks
                    .get(number as usize)
                    .map(|block| json!(block))
                    .unwrap_or(Value::Null))
            }
            "eth_getBlockByHash" => {
                let hash: B256 = decode_param(&params[0])?;
                Ok(state
                    .blocks
                    .iter()
                    .find(|block| block.hash == hash)
                    .map(|block| json!(block))
                    .unwrap_or(Value::Null))
            }
            "eth_getTransactionByHash" => {
                let hash: B256 = decode_param(&params[0])?;
                Ok(state
                    .blocks
                    .iter()
                    .flat_map(|block| block.transactions.iter())
                    .find(|tx| tx.hash == hash)
                    .map(|tx| json!(tx))
                    .unwrap_or(Value::Null))
            }
            "eth_getTransactionReceipt" => {
                let hash: B256 = decode_param(&params[0])?;
                Ok(state.receipts.get(&hash).map(|r| json!(r)).unwrap_or(Value::Null))
            }
            "eth_getBalance" => {
                let address: Address = decode_param(&params[0])?;
                Ok(json!(state.balances.get(&address).copied().unwrap_or_default()))
            }
            "eth_getLogs" => {
                let filter = &params[0];
                let from = parse_quantity(filter["fromBlock"].as_str().unwrap_or("0x0"))?;
                let to = parse_quantity(filter["toBlock"].as_str().unwrap_or("0x0"))?;
                if let Some(span) = *self.max_log_span.lock().unwrap() {
                    if to - from + 1 > span {
                        return Err(ChainError::Rpc {
                            code: -32005,
                            message: format!("block range too wide, max {} blocks", span),
                        });
                    }
                }
                let addresses: Vec<Address> = match filter.get("address") {
                    Some(value) => decode_param(value)?,
                    None => Vec::new(),
                };
                let logs: Vec<&Log> = state
                    .logs
                    .iter()
                    .filter(|log| {
                        let number = log.block_number.unwrap_or_default();
                        number >= from
                            && number <= to
                            && (addresses.is_empty() || addresses.contains(&log.address))
                    })
                    .collect();
                Ok(json!(logs))
            }
            "eth_call" => {
                let to: Address = decode_param(&params[0]["to"])?;
                let data: Bytes = decode_param(&params[0]["data"])?;
                if to != token_address() {
                    return Ok(json!("0x"));
                }
                self.token_getter(&state.token, &data)
            }
            other => Err(ChainError::Rpc {
                code: -32601,
                message: format!("method {} not found", other),
            }),
        }
    }

    fn token_getter(&self, token: &TokenState, data: &[u8]) -> Result<Value, ChainError> {
        if data.len() < 4 {
            return Err(revert("missing selector"));
        }
        let function = self
            .abi
            .inner()
            .functions()
            .find(|f| f.selector().as_slice() == &data[..4])
            .ok_or_else(|| revert("unknown selector"))?;
        let args = function
            .abi_decode_input(&data[4..], true)
            .map_err(|e| revert(&e.to_string()))?;

        let key = |i: usize| match args.get(i) {
            Some(DynSolValue::Address(a)) => Ok(*a),
            _ => Err(revert("expected an address argument")),
        };

        let outputs = match function.name.as_str() {
            "name" => vec![DynSolValue::String("Sample Token".to_string())],
            "totalSupply" if token.total_supply_reverts => return Err(revert("paused")),
            "totalSupply" => vec![DynSolValue::Uint(token.total_supply, 256)],
            "tokenFrozen" => vec![DynSolValue::Bool(token.frozen)],
            "balanceOf" => {
                let owner = key(0)?;
                vec![DynSolValue::Uint(
                    token.balances.get(&owner).copied().unwrap_or_default(),
                    256,
                )]
            }
            "buyer" => {
                let (approved, limit) = token.buyers.get(&key(0)?).copied().unwrap_or_default();
                vec![DynSolValue::Bool(approved), DynSolValue::Uint(limit, 256)]
            }
            _ => return Err(revert("not a getter")),
        };

        let encoded = function
            .abi_encode_output(&outputs)
            .map_err(|e| revert(&e.to_string()))?;
        Ok(json!(Bytes::from(encoded)))
    }
}

#[async_trait]
impl RpcTransport for MockChain {
    async fn send(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, ChainError> {
        if self.down.lock().unwrap().contains(endpoint) {
            return Err(ChainError::Connection {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        *self.calls.lock().unwrap().entry(method.to_string()).or_default() += 1;
        self.served_by.lock().unwrap().push(endpoint.to_string());
        self.dispatch(method, &params)
    }
}

fn parse_quantity(hex: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Decode(format!("bad quantity {}: {}", hex, e)))
}

fn decode_param<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, ChainError> {
    serde_json::from_value(value.clone()).map_err(|e| ChainError::Decode(e.to_string()))
}

fn bad_params(method: &str) -> ChainError {
    ChainError::Rpc {
        code: -32602,
        message: format!("invalid params for {}", method),
    }
}

fn revert(reason: &str) -> ChainError {
    ChainError::Rpc {
        code: 3,
        message: format!("execution reverted: {}", reason),
    }
}

pub fn chain_settings() -> ChainClientSettings {
    ChainClientSettings {
        rate_limit: None,
        max_endpoint_cycles: 2,
        retry_min_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
        max_log_range_halvings: 20,
        max_logs_per_query: 10_000,
        poll_interval: Duration::from_millis(20),
    }
}

pub fn indexing_settings() -> IndexingSettings {
    IndexingSettings {
        bulk_batch_size: 50,
        flush_interval: Duration::from_secs(3600),
        log_page_size: 4,
        backfill_page_size: 3,
        concurrency: 4,
    }
}

pub async fn store() -> Pool<Sqlite> {
    connection::establish_connection("sqlite::memory:")
        .await
        .expect("in-memory store")
}

pub async fn client(chain: &Arc<MockChain>, settings: ChainClientSettings) -> Arc<ChainClient> {
    let transport: Arc<dyn RpcTransport> = chain.clone();
    Arc::new(
        ChainClient::connect(vec![PRIMARY.to_string(), BACKUP.to_string()], transport, settings)
            .await
            .expect("client connects"),
    )
}

pub fn address_source(id: &str) -> DataSourceConfig {
    DataSourceConfig {
        id: id.to_string(),
        source_type: "ethereum".to_string(),
        params: json!({
            "jsonRpcUrls": [PRIMARY, BACKUP],
            "addressIndexing": {
                "trackedAddressContentType": WALLET_TYPE,
                "trackedAddressField": WALLET_FIELD
            }
        }),
    }
}

pub fn token_source() -> DataSourceConfig {
    DataSourceConfig {
        id: "sample-token".to_string(),
        source_type: "ethereum".to_string(),
        params: json!({
            "jsonRpcUrls": [PRIMARY],
            "contract": {
                "abi": token_abi_json(),
                "address": id_of(&token_address()),
                "eventContentTriggers": {
                    "Mint": ["sample-token-balance-ofs", "sample-tokens"],
                    "Transfer": ["sample-token-balance-ofs"],
                    "BuyerApproved": ["sample-token-buyers"],
                    "BuyerLimitSet": ["sample-token-buyers"]
                },
                "indexingSkipIndicators": ["tokenFrozen"]
            }
        }),
    }
}

/// Store a tracked-address list document naming `addresses`
pub async fn save_wallet(pool: &Pool<Sqlite>, id: &str, addresses: &[Address]) {
    let mut doc = Document::new(WALLET_TYPE, id);
    doc.set_attribute(
        WALLET_FIELD,
        Value::Array(addresses.iter().map(|a| json!(id_of(a))).collect()),
    );
    documents::upsert_documents(pool, &[doc], None, None)
        .await
        .expect("wallet saved");
}

pub async fn remove_wallet(pool: &Pool<Sqlite>, id: &str) {
    documents::delete_documents(pool, &[crate::models::DocumentRef::new(WALLET_TYPE, id)])
        .await
        .expect("wallet removed");
}

/// One Ethereum data source behind a coordinator
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub pool: Pool<Sqlite>,
    pub indexer: EthereumIndexer,
    pub coordinator: Arc<IndexingCoordinator>,
}

impl Harness {
    pub async fn start(chain: &Arc<MockChain>, pool: &Pool<Sqlite>, config: DataSourceConfig) -> Self {
        let context = IndexerContext {
            transport: chain.clone(),
            chain: chain_settings(),
            indexing: indexing_settings(),
        };
        let indexer = EthereumIndexer::connect(&config, &context)
            .await
            .expect("data source activates");

        let mut sources = DataSourceRegistry::new();
        sources.insert(config, Arc::new(indexer.clone()));

        let buffer = Arc::new(BulkWriteBuffer::new(pool.clone(), context.indexing.bulk_batch_size));
        let coordinator = Arc::new(IndexingCoordinator::new(
            buffer,
            sources,
            SchemaCache::new(100, Duration::from_secs(60)),
        ));

        Self {
            chain: chain.clone(),
            pool: pool.clone(),
            indexer,
            coordinator,
        }
    }

    pub async fn full_pass(&self) {
        self.coordinator
            .update(UpdateRequest::real_time())
            .await
            .expect("full pass succeeds");
    }

    pub async fn hinted_pass(&self, hints: Vec<Hint>) -> PassResult {
        self.coordinator.update(UpdateRequest::best_effort(hints)).await
    }

    pub async fn doc(&self, doc_type: &str, id: &str) -> Option<Document> {
        documents::get_document(&self.pool, doc_type, id)
            .await
            .expect("store readable")
    }

    pub async fn count(&self, doc_type: &str) -> i64 {
        documents::count_documents(&self.pool, doc_type)
            .await
            .expect("store readable")
    }
}

/// Shared controls of a [`ScriptedIndexer`]
pub struct Script {
    passes: Mutex<Vec<Vec<Hint>>>,
    saves: Mutex<Vec<Document>>,
    pub gate: Semaphore,
    pub fail: AtomicBool,
}

impl Script {
    /// Every pass waits for a permit on `gate`
    pub fn gated() -> Arc<Self> {
        Self::with_permits(0)
    }

    pub fn open() -> Arc<Self> {
        Self::with_permits(10_000)
    }

    fn with_permits(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            passes: Mutex::new(Vec::new()),
            saves: Mutex::new(Vec::new()),
            gate: Semaphore::new(permits),
            fail: AtomicBool::new(false),
        })
    }

    /// Hints received by each pass so far, in pass order
    pub fn passes(&self) -> Vec<Vec<Hint>> {
        self.passes.lock().unwrap().clone()
    }

    /// Save `doc` during the next pass
    pub fn save_next(&self, doc: Document) {
        self.saves.lock().unwrap().push(doc);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

/// Indexer without a chain: records its passes, counts them in its meta and
/// fails on demand
pub struct ScriptedIndexer {
    source_id: String,
    script: Arc<Script>,
}

impl ScriptedIndexer {
    pub fn new(source_id: &str, script: Arc<Script>) -> Self {
        Self {
            source_id: source_id.to_string(),
            script,
        }
    }

    pub fn config(source_id: &str) -> DataSourceConfig {
        DataSourceConfig {
            id: source_id.to_string(),
            source_type: "scripted".to_string(),
            params: Value::Null,
        }
    }
}

struct ScriptedUpdater {
    source_id: String,
    script: Arc<Script>,
}

#[async_trait]
impl Updater for ScriptedUpdater {
    async fn update_content(
        &mut self,
        meta: Option<Value>,
        hints: &[Hint],
        ops: &Operations,
    ) -> Result<Value, IndexingError> {
        self.script.passes.lock().unwrap().push(hints.to_vec());
        self.script
            .gate
            .acquire()
            .await
            .map_err(|_| IndexingError::Stopped)?
            .forget();

        let docs = std::mem::take(&mut *self.script.saves.lock().unwrap());
        for doc in docs {
            ops.save(doc).await?;
        }

        if self.script.fail.load(Ordering::SeqCst) {
            return Err(IndexingError::DataSource {
                source_id: self.source_id.clone(),
                reason: "scripted failure".to_string(),
            });
        }

        let passes = meta
            .as_ref()
            .and_then(|m| m.get("passes"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(json!({ "passes": passes + 1 }))
    }
}

#[async_trait]
impl Indexer for ScriptedIndexer {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn begin_update(&self) -> Box<dyn Updater> {
        Box::new(ScriptedUpdater {
            source_id: self.source_id.clone(),
            script: Arc::clone(&self.script),
        })
    }
}

/// Coordinator over scripted indexers, one per `(source_id, script)`
pub async fn scripted_coordinator(
    pool: &Pool<Sqlite>,
    sources: &[(&str, Arc<Script>)],
) -> Arc<IndexingCoordinator> {
    let mut registry = DataSourceRegistry::new();
    for (source_id, script) in sources {
        registry.insert(
            ScriptedIndexer::config(source_id),
            Arc::new(ScriptedIndexer::new(source_id, Arc::clone(script))),
        );
    }

    Arc::new(IndexingCoordinator::new(
        Arc::new(BulkWriteBuffer::new(pool.clone(), 50)),
        registry,
        SchemaCache::new(100, Duration::from_secs(60)),
    ))
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
