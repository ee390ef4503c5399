use crate::blockchain::abi::address_id;
use crate::blockchain::client::ChainClient;
use crate::blockchain::models::{BlockNotification, LogFilter};
use crate::blockchain::subscription::LiveFilter;
use crate::config::{AddressIndexingConfig, DataSourceConfig, EthereumSourceParams};
use crate::indexing::contracts::{ContractEventIndexer, ContractMeta, ContractSpec};
use crate::indexing::error::IndexingError;
use crate::indexing::live::LiveUpdates;
use crate::indexing::operations::Operations;
use crate::indexing::tracker::{referenced_addresses, referrer_key, AddressTracker};
use crate::indexing::transactions::TransactionIndexer;
use crate::indexing::updater::{Indexer, IndexerContext, IndexerFactory, Updater};
use crate::models::Hint;
use crate::validation::validate_ethereum_address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const SOURCE_TYPE: &str = "ethereum";

/// Scope under which contract documents are tagged
const CONTRACT_SCOPE: &str = "contract";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<ContractMeta>,
    #[serde(default)]
    pub addresses: AddressesMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressesMeta {
    #[serde(default)]
    pub last_indexed_block: BTreeMap<String, u64>,
}

struct AddressIndexing {
    config: AddressIndexingConfig,
    transactions: TransactionIndexer,
}

impl AddressIndexing {
    async fn update(&self, meta: &mut AddressesMeta, hints: &[Hint], ops: &Operations) -> Result<(), IndexingError> {
        // The persisted meta is the only progress known to be in the store
        self.transactions.restore(&meta.last_indexed_block).await;

        let tracker = self.transactions.tracker();
        let content_type = &self.config.tracked_address_content_type;
        let field = &self.config.tracked_address_field;

        if hints.is_empty() {
            let referrers = ops.query_all(content_type).await?;
            tracker
                .reconcile(
                    referrers
                        .iter()
                        .map(|doc| (referrer_key(doc), referenced_addresses(doc, field))),
                )
                .await;
            for address in self.transactions.orphaned().await {
                self.transactions.purge(address, ops).await?;
            }
        } else {
            for hint in hints {
                let Hint::Document(doc_ref) = hint else {
                    continue;
                };
                if doc_ref.doc_type != *content_type {
                    continue;
                }
                match ops.read(&doc_ref.doc_type, &doc_ref.id).await? {
                    Some(doc) => {
                        tracker
                            .sync_document(&referrer_key(&doc), referenced_addresses(&doc, field))
                            .await;
                    }
                    None => {
                        tracker.remove_referrer(&doc_ref.to_string()).await;
                    }
                }
            }
        }

        let (backfills, purges) = tracker.take_scheduled().await;
        for address in purges {
            self.transactions.purge(address, ops).await?;
        }
        if !backfills.is_empty() {
            info!("Backfilling {} newly tracked addresses", backfills.len());
            self.transactions.backfill(&backfills, ops).await?;
        }
        self.transactions.catch_up(ops).await?;

        for hint in hints {
            if let Hint::Address(raw) = hint {
                if let Ok(address) = validate_ethereum_address(raw) {
                    self.transactions.refresh_balance(address, ops).await?;
                }
            }
        }

        meta.last_indexed_block = self.transactions.snapshot().await;
        Ok(())
    }
}

struct EthereumSession {
    source_id: String,
    client: Arc<ChainClient>,
    contract: Option<ContractEventIndexer>,
    addresses: Option<AddressIndexing>,
}

/// Indexer for an `ethereum` data source: tracked-address transaction
/// history and/or one contract's state, mappings and events.
#[derive(Clone)]
pub struct EthereumIndexer {
    session: Arc<EthereumSession>,
}

impl EthereumIndexer {
    /// Validate the data source and connect to its RPC endpoints
    pub async fn connect(config: &DataSourceConfig, context: &IndexerContext) -> Result<Self, IndexingError> {
        let params = EthereumSourceParams::from_config(config)?;
        let contract_spec = params
            .contract
            .as_ref()
            .map(|contract| ContractSpec::from_config(&config.id, contract))
            .transpose()?;

        let client = Arc::new(
            ChainClient::connect(
                params.json_rpc_urls.clone(),
                Arc::clone(&context.transport),
                context.chain.clone(),
            )
            .await?,
        );

        let contract = contract_spec
            .map(|spec| ContractEventIndexer::new(spec, Arc::clone(&client), &context.indexing));

        let addresses = params.address_indexing.map(|indexing| {
            let tracker = Arc::new(AddressTracker::new(
                LiveFilter::default(),
                indexing.max_addresses_tracked,
            ));
            AddressIndexing {
                transactions: TransactionIndexer::new(
                    Arc::clone(&client),
                    tracker,
                    indexing.start_block.unwrap_or(0),
                    &context.indexing,
                ),
                config: indexing,
            }
        });

        info!(
            "Activated ethereum data source {} (contract: {}, address indexing: {})",
            config.id,
            contract.is_some(),
            addresses.is_some()
        );

        Ok(Self {
            session: Arc::new(EthereumSession {
                source_id: config.id.clone(),
                client,
                contract,
                addresses,
            }),
        })
    }

    pub fn client(&self) -> &Arc<ChainClient> {
        &self.session.client
    }

    pub fn transactions(&self) -> Option<&TransactionIndexer> {
        self.session.addresses.as_ref().map(|a| &a.transactions)
    }

    pub fn tracker(&self) -> Option<&Arc<AddressTracker>> {
        self.transactions().map(TransactionIndexer::tracker)
    }

    pub fn contract(&self) -> Option<&ContractEventIndexer> {
        self.session.contract.as_ref()
    }
}

struct EthereumUpdater {
    session: Arc<EthereumSession>,
}

#[async_trait]
impl Updater for EthereumUpdater {
    async fn update_content(
        &mut self,
        meta: Option<Value>,
        hints: &[Hint],
        ops: &Operations,
    ) -> Result<Value, IndexingError> {
        let source_id = &self.session.source_id;
        let invalid_meta = |e: serde_json::Error| IndexingError::InvalidMeta {
            source_id: source_id.clone(),
            reason: e.to_string(),
        };

        let mut meta: EthereumMeta = match meta {
            Some(value) => serde_json::from_value(value).map_err(invalid_meta)?,
            None => EthereumMeta::default(),
        };

        if let Some(addresses) = &self.session.addresses {
            addresses.update(&mut meta.addresses, hints, ops).await?;
        }

        if let Some(contract) = &self.session.contract {
            let contract_ops = ops.scoped(CONTRACT_SCOPE);
            let previous = meta.contract.take().unwrap_or_default();
            meta.contract = Some(contract.run_pass(previous, hints, &contract_ops).await?);
        }

        debug!("{} pass complete", source_id);
        serde_json::to_value(&meta).map_err(invalid_meta)
    }
}

#[async_trait]
impl Indexer for EthereumIndexer {
    fn source_id(&self) -> &str {
        &self.session.source_id
    }

    fn begin_update(&self) -> Box<dyn Updater> {
        Box::new(EthereumUpdater {
            session: Arc::clone(&self.session),
        })
    }

    async fn subscribe(&self, live: LiveUpdates) -> Result<(), IndexingError> {
        let client = &self.session.client;

        if let Some(addresses) = &self.session.addresses {
            let filter = addresses.transactions.tracker().live_filter().clone();
            let updates = live.clone();
            client
                .subscribe_new_blocks(filter, move |notification: BlockNotification| {
                    if !notification.touched.is_empty() {
                        updates.request(
                            notification
                                .touched
                                .iter()
                                .map(|address| Hint::Address(address_id(address)))
                                .collect(),
                        );
                    }
                })
                .await?;
        }

        if let Some(contract) = &self.session.contract {
            let contract_id = address_id(&contract.address());
            client
                .subscribe_logs(LogFilter::for_address(contract.address()), move |_log| {
                    live.request(vec![Hint::Contract(contract_id.clone())]);
                })
                .await?;
        }

        Ok(())
    }

    async fn shutdown(&self) {
        self.session.client.stop_all().await;
    }
}

pub struct EthereumIndexerFactory;

#[async_trait]
impl IndexerFactory for EthereumIndexerFactory {
    fn source_type(&self) -> &'static str {
        SOURCE_TYPE
    }

    async fn create(
        &self,
        config: &DataSourceConfig,
        context: &IndexerContext,
    ) -> Result<Arc<dyn Indexer>, IndexingError> {
        Ok(Arc::new(EthereumIndexer::connect(config, context).await?))
    }
}
