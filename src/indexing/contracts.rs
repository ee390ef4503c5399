//! Contract state, mapping entries and event documents for one contract.

use crate::blockchain::abi::{
    address_id, decode_output, encode_call, key_part, to_json, ContractAbi, DecodedLog,
};
use crate::blockchain::client::{ChainClient, ChainError};
use crate::blockchain::models::{Log, LogFilter};
use crate::config::{ConfigError, ContractConfig};
use crate::indexing::error::IndexingError;
use crate::indexing::keyed::KeyedLocks;
use crate::indexing::operations::Operations;
use crate::indexing::schema::{
    contract_type, derive_content_types, event_relationship, event_type, kebab_case, mapping_type,
    output_attribute, ValueKind,
};
use crate::indexing::IndexingSettings;
use crate::models::{Document, DocumentRef, Hint, Relationship};
use crate::validation::{checksum_address, validate_ethereum_address};
use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_json_abi::Function;
use alloy_primitives::Address;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DATA_SOURCE_TYPE: &str = "data-sources";

/// Resume state of one contract, stored under `contract` in the indexer meta
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractMeta {
    #[serde(default)]
    pub last_indexed_block: Option<u64>,
    #[serde(default)]
    pub generation_nonce: Option<String>,
    #[serde(default)]
    pub skipping: bool,
}

/// Validated contract configuration
#[derive(Debug, Clone)]
pub struct ContractSpec {
    pub source_id: String,
    pub address: Address,
    pub abi: ContractAbi,
    pub triggers: BTreeMap<String, Vec<String>>,
    pub skip_indicators: Vec<String>,
    pub start_block: u64,
}

impl ContractSpec {
    pub fn from_config(source_id: &str, config: &ContractConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::invalid(source_id, reason);

        let address = validate_ethereum_address(&config.address)
            .map_err(|e| invalid(format!("contract address: {}", e)))?;
        let abi = ContractAbi::from_json(&config.abi).map_err(|e| invalid(e.to_string()))?;

        let contract = contract_type(source_id);
        let mappings: Vec<String> = abi
            .mapping_getters()
            .iter()
            .map(|getter| mapping_type(source_id, &getter.name))
            .collect();

        for (event, types) in &config.event_content_triggers {
            abi.event(event)
                .map_err(|e| invalid(format!("eventContentTriggers: {}", e)))?;
            for type_name in types {
                if *type_name != contract && !mappings.contains(type_name) {
                    return Err(invalid(format!(
                        "eventContentTriggers: {} triggers unknown content type {}",
                        event, type_name
                    )));
                }
            }
        }

        for indicator in &config.indexing_skip_indicators {
            let getter = abi
                .function(indicator)
                .map_err(|e| invalid(format!("indexingSkipIndicators: {}", e)))?;
            let boolean = getter.outputs.len() == 1 && getter.outputs[0].ty == "bool";
            if !getter.inputs.is_empty() || !boolean {
                return Err(invalid(format!(
                    "indexingSkipIndicators: {} must take no arguments and return a bool",
                    indicator
                )));
            }
        }

        Ok(Self {
            source_id: source_id.to_string(),
            address,
            abi,
            triggers: config.event_content_triggers.clone(),
            skip_indicators: config.indexing_skip_indicators.clone(),
            start_block: config.start_block.unwrap_or(0),
        })
    }
}

/// Pending refresh of one mapping document
struct KeyWork {
    getter: String,
    args: Vec<DynSolValue>,
    events: Vec<(String, DocumentRef)>,
    block_height: Option<u64>,
}

type WorkQueue = BTreeMap<(String, String), KeyWork>;

pub struct ContractEventIndexer {
    spec: ContractSpec,
    client: Arc<ChainClient>,
    log_page_size: u64,
    concurrency: usize,
    locks: KeyedLocks,
}

impl ContractEventIndexer {
    pub fn new(spec: ContractSpec, client: Arc<ChainClient>, settings: &IndexingSettings) -> Self {
        Self {
            spec,
            client,
            log_page_size: settings.log_page_size.max(1),
            concurrency: settings.concurrency.max(1),
            locks: KeyedLocks::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.spec.address
    }

    pub fn content_types(&self) -> Vec<Document> {
        derive_content_types(&self.spec.source_id, &self.spec.abi, &self.spec.triggers)
    }

    fn contract_ref(&self) -> DocumentRef {
        DocumentRef::new(contract_type(&self.spec.source_id), address_id(&self.spec.address))
    }

    fn mapping_getter_for(&self, type_name: &str) -> Option<&Function> {
        self.spec
            .abi
            .mapping_getters()
            .into_iter()
            .find(|getter| mapping_type(&self.spec.source_id, &getter.name) == type_name)
    }

    async fn call(&self, getter: &Function, args: &[DynSolValue]) -> Result<Vec<DynSolValue>, IndexingError> {
        let data = encode_call(getter, args)?;
        let output = self.client.call(self.spec.address, data).await?;
        Ok(decode_output(getter, &output)?)
    }

    /// True when any skip indicator getter currently returns true
    pub async fn is_frozen(&self) -> Result<bool, IndexingError> {
        for indicator in &self.spec.skip_indicators {
            let getter = self.spec.abi.function(indicator)?;
            let output = self.call(getter, &[]).await?;
            if matches!(output.first(), Some(DynSolValue::Bool(true))) {
                debug!("{} reports {} = true", self.spec.source_id, indicator);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// One pass: logs since the last indexed block, or everything since the
    /// start block as a replace-all generation when there is no prior state
    /// or the contract just came out of a frozen period.
    pub async fn run_pass(
        &self,
        meta: ContractMeta,
        hints: &[Hint],
        ops: &Operations,
    ) -> Result<ContractMeta, IndexingError> {
        let source_id = &self.spec.source_id;
        let head = self.client.current_block_height().await?;

        if self.is_frozen().await? {
            debug!("{} is frozen, skipping pass at block {}", source_id, head);
            return Ok(ContractMeta {
                skipping: true,
                ..meta
            });
        }

        let full = meta.last_indexed_block.is_none() || meta.skipping;
        let mut generation_nonce = meta.generation_nonce.clone();
        let from = if full {
            info!("{} indexing contract from block {} (full pass)", source_id, self.spec.start_block);
            generation_nonce = Some(ops.begin_replace_all());
            for content_type in self.content_types() {
                ops.save(content_type).await?;
            }
            self.spec.start_block
        } else {
            meta.last_indexed_block.map(|b| b + 1).unwrap_or(self.spec.start_block)
        };

        let contract_id = address_id(&self.spec.address);
        let mut refresh_contract = full
            || hints.iter().any(|hint| match hint {
                Hint::Contract(address) => address.eq_ignore_ascii_case(&contract_id),
                _ => false,
            });

        let mut work = self.hinted_work(hints);
        let filter = LogFilter::for_address(self.spec.address);
        let mut page_start = from;

        while page_start <= head {
            let page_end = page_start.saturating_add(self.log_page_size - 1).min(head);
            let logs = self.client.get_past_logs(page_start, page_end, &filter).await?;
            if !logs.is_empty() {
                debug!("{} processing {} logs from {}-{}", source_id, logs.len(), page_start, page_end);
            }

            for log in &logs {
                refresh_contract |= self.process_log(log, &mut work, ops).await?;
            }
            self.apply_work(std::mem::take(&mut work), ops).await?;
            page_start = page_end + 1;
        }
        self.apply_work(work, ops).await?;

        if refresh_contract {
            self.refresh_contract_document(head, ops).await?;
        }
        if full {
            ops.finish_replace_all().await?;
        }

        Ok(ContractMeta {
            last_indexed_block: Some(head.max(from.saturating_sub(1))),
            generation_nonce,
            skipping: false,
        })
    }

    /// Mapping documents named by `Document` hints
    fn hinted_work(&self, hints: &[Hint]) -> WorkQueue {
        let mut work = WorkQueue::new();
        for hint in hints {
            let Hint::Document(doc_ref) = hint else {
                continue;
            };
            let Some(getter) = self.mapping_getter_for(&doc_ref.doc_type) else {
                continue;
            };
            match parse_key(getter, &doc_ref.id) {
                Some(args) => {
                    work.insert(
                        (doc_ref.doc_type.clone(), doc_ref.id.clone()),
                        KeyWork {
                            getter: getter.name.clone(),
                            args,
                            events: Vec::new(),
                            block_height: None,
                        },
                    );
                }
                None => warn!("Hint {} does not name a valid key for {}", doc_ref, getter.name),
            }
        }
        work
    }

    /// Save the event document and queue the mapping documents it triggers.
    /// Returns true when the event triggers the contract document.
    async fn process_log(&self, log: &Log, work: &mut WorkQueue, ops: &Operations) -> Result<bool, IndexingError> {
        let Some(decoded) = self.spec.abi.decode_log(log)? else {
            return Ok(false);
        };

        let event_doc = self.event_document(log, &decoded);
        let event_ref = event_doc.reference();
        ops.save(event_doc).await?;

        let event_name = &decoded.event.name;
        let Some(types) = self.spec.triggers.get(event_name) else {
            return Ok(false);
        };

        let contract = contract_type(&self.spec.source_id);
        let relationship = event_relationship(event_name);
        let mut refresh_contract = false;

        for type_name in types {
            if *type_name == contract {
                refresh_contract = true;
                continue;
            }
            let Some(getter) = self.mapping_getter_for(type_name) else {
                continue;
            };

            for args in mapping_keys(getter, &decoded) {
                let id = key_id(&args);
                let entry = work
                    .entry((type_name.clone(), id))
                    .or_insert_with(|| KeyWork {
                        getter: getter.name.clone(),
                        args,
                        events: Vec::new(),
                        block_height: None,
                    });
                entry.events.push((relationship.clone(), event_ref.clone()));
                entry.block_height = entry.block_height.max(log.block_number);
            }
        }

        Ok(refresh_contract)
    }

    async fn apply_work(&self, work: WorkQueue, ops: &Operations) -> Result<(), IndexingError> {
        stream::iter(work)
            .map(|((type_name, id), key_work)| self.update_mapping(type_name, id, key_work, ops))
            .buffer_unordered(self.concurrency)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    /// Re-read one mapping entry and merge it into the stored document
    async fn update_mapping(
        &self,
        type_name: String,
        id: String,
        work: KeyWork,
        ops: &Operations,
    ) -> Result<(), IndexingError> {
        let _guard = self.locks.lock(&format!("{}/{}", type_name, id)).await;

        let getter = self.spec.abi.function(&work.getter)?;
        let outputs = self.call(getter, &work.args).await?;

        let mut doc = ops
            .read(&type_name, &id)
            .await?
            .unwrap_or_else(|| Document::new(type_name.clone(), id.clone()));

        if let [single] = outputs.as_slice() {
            let kind = ValueKind::of(&getter.outputs[0].ty);
            doc.set_attribute(kind.mapping_attribute(), to_json(single));
        } else {
            for (index, value) in outputs.iter().enumerate() {
                doc.set_attribute(output_attribute(getter, index), to_json(value));
            }
        }
        if let [DynSolValue::Address(key)] = work.args.as_slice() {
            doc.set_attribute("ethereum-address", checksum_address(key));
        }

        doc.set_relationship("contract", Relationship::One(Some(self.contract_ref())));
        for (relationship, event_ref) in work.events {
            doc.add_to_many(&relationship, event_ref);
        }
        if work.block_height.is_some() {
            doc.meta.block_height = doc.meta.block_height.max(work.block_height);
        }

        ops.save(doc).await
    }

    fn event_document(&self, log: &Log, decoded: &DecodedLog) -> Document {
        let tx_hash = log
            .transaction_hash
            .map(|hash| hash.to_string())
            .unwrap_or_default();
        let id = format!("{}_{}", tx_hash, log.log_index.unwrap_or_default());

        let mut doc = Document::new(event_type(&self.spec.source_id, &decoded.event.name), id);
        doc.set_attribute("block-number", log.block_number.unwrap_or_default());
        doc.set_attribute("transaction-hash", tx_hash);
        doc.set_attribute("event-name", decoded.event.name.clone());
        for field in &decoded.fields {
            doc.set_attribute(kebab_case(&field.name), to_json(&field.value));
        }
        doc.set_relationship("contract", Relationship::One(Some(self.contract_ref())));
        doc.meta.block_height = log.block_number;
        doc
    }

    /// Contract state document: one attribute per zero-argument getter
    pub async fn refresh_contract_document(&self, head: u64, ops: &Operations) -> Result<(), IndexingError> {
        let contract_ref = self.contract_ref();
        let _guard = self.locks.lock(&contract_ref.to_string()).await;
        let mut doc = Document::new(contract_ref.doc_type, contract_ref.id);

        for getter in self.spec.abi.state_getters() {
            match self.call(getter, &[]).await {
                Ok(output) => {
                    if let Some(value) = output.first() {
                        doc.set_attribute(kebab_case(&getter.name), to_json(value));
                    }
                }
                // A reverting getter leaves its attribute unset
                Err(IndexingError::Chain(ChainError::Rpc { message, .. })) => {
                    warn!("{}.{} reverted: {}", self.spec.source_id, getter.name, message);
                }
                Err(e) => return Err(e),
            }
        }

        doc.set_attribute("ethereum-address", checksum_address(&self.spec.address));
        doc.set_attribute(
            "balance-wei",
            self.client.get_balance(self.spec.address).await?.to_string(),
        );
        doc.set_relationship(
            "data-source",
            Relationship::One(Some(DocumentRef::new(DATA_SOURCE_TYPE, self.spec.source_id.clone()))),
        );
        doc.meta.block_height = Some(head);

        ops.save(doc).await
    }
}

/// Argument lists to call `getter` with for one decoded event.
///
/// A single address parameter is keyed by every non-zero address argument of
/// the event. Any other single parameter takes the first event argument of
/// the same type. Several parameters are matched in order against the event
/// arguments. Keys containing the zero address are dropped.
pub fn mapping_keys(getter: &Function, decoded: &DecodedLog) -> Vec<Vec<DynSolValue>> {
    if let [input] = getter.inputs.as_slice() {
        if input.ty == "address" {
            let mut keys: Vec<Address> = Vec::new();
            for field in &decoded.fields {
                if let DynSolValue::Address(address) = field.value {
                    if address != Address::ZERO && !keys.contains(&address) {
                        keys.push(address);
                    }
                }
            }
            return keys
                .into_iter()
                .map(|address| vec![DynSolValue::Address(address)])
                .collect();
        }

        return decoded
            .fields
            .iter()
            .find(|field| field.sol_type == input.ty)
            .map(|field| vec![vec![field.value.clone()]])
            .unwrap_or_default();
    }

    let mut args = Vec::with_capacity(getter.inputs.len());
    let mut next = 0;
    for input in &getter.inputs {
        let Some(offset) = decoded.fields[next..]
            .iter()
            .position(|field| field.sol_type == input.ty)
        else {
            return Vec::new();
        };
        let field = &decoded.fields[next + offset];
        if matches!(field.value, DynSolValue::Address(address) if address == Address::ZERO) {
            return Vec::new();
        }
        args.push(field.value.clone());
        next += offset + 1;
    }
    vec![args]
}

/// Document id of a mapping entry: key parts joined with `_`
pub fn key_id(args: &[DynSolValue]) -> String {
    args.iter().map(key_part).collect::<Vec<_>>().join("_")
}

/// Inverse of [`key_id`] for `getter`'s parameter types
pub fn parse_key(getter: &Function, id: &str) -> Option<Vec<DynSolValue>> {
    let parts: Vec<&str> = if getter.inputs.len() == 1 {
        vec![id]
    } else {
        id.split('_').collect()
    };
    if parts.len() != getter.inputs.len() {
        return None;
    }

    getter
        .inputs
        .iter()
        .zip(parts)
        .map(|(input, part)| DynSolType::parse(&input.ty).ok()?.coerce_str(part).ok())
        .collect()
}
