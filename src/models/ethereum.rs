//! Engine-owned Ethereum documents: addresses and transactions.

use crate::blockchain::abi::address_id;
use crate::blockchain::models::{Block, Receipt, Transaction};
use crate::models::{ChainPosition, Document, DocumentRef, Relationship};
use crate::validation::checksum_address;
use alloy_primitives::{Address, U256};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const ADDRESS_TYPE: &str = "ethereum-addresses";
pub const TRANSACTION_TYPE: &str = "ethereum-transactions";

/// `${blockHeight}.${subIndex}`; ordered lexicographically on the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DocumentVersion {
    pub block_height: u64,
    pub sub_index: u64,
}

impl DocumentVersion {
    pub fn parse(version: &str) -> Option<Self> {
        let (height, sub) = version.split_once('.')?;
        Some(Self {
            block_height: height.parse().ok()?,
            sub_index: sub.parse().ok()?,
        })
    }

    /// Version for an update reflecting `block_height`. Never moves backwards:
    /// a second update within the same (or an older) block bumps the sub index.
    pub fn next(previous: Option<Self>, block_height: u64) -> Self {
        match previous {
            Some(prev) if prev.block_height >= block_height => Self {
                block_height: prev.block_height,
                sub_index: prev.sub_index + 1,
            },
            _ => Self {
                block_height,
                sub_index: 0,
            },
        }
    }
}

impl fmt::Display for DocumentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.block_height, self.sub_index)
    }
}

pub fn transaction_ref(hash: &str, position: ChainPosition) -> DocumentRef {
    DocumentRef::new(TRANSACTION_TYPE, hash.to_lowercase()).at(position)
}

pub fn address_ref(address: &Address) -> DocumentRef {
    DocumentRef::new(ADDRESS_TYPE, address_id(address))
}

/// Typed view of an `ethereum-addresses` document
#[derive(Debug, Clone, PartialEq)]
pub struct AddressDocument {
    pub address: Address,
    pub balance_wei: U256,
    pub transactions: Vec<DocumentRef>,
    pub version: Option<DocumentVersion>,
}

impl AddressDocument {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance_wei: U256::ZERO,
            transactions: Vec::new(),
            version: None,
        }
    }

    pub fn id(&self) -> String {
        address_id(&self.address)
    }

    pub fn from_document(doc: &Document) -> Option<Self> {
        let address = Address::from_str(&doc.id).ok()?;
        let balance_wei = doc
            .attribute("balance-wei")
            .and_then(Value::as_str)
            .and_then(|s| U256::from_str(s).ok())
            .unwrap_or_default();
        let transactions = match doc.relationship("transactions") {
            Some(Relationship::Many(refs)) => refs.clone(),
            _ => Vec::new(),
        };
        let version = doc.meta.version.as_deref().and_then(DocumentVersion::parse);

        Some(Self {
            address,
            balance_wei,
            transactions,
            version,
        })
    }

    pub fn into_document(self) -> Document {
        let mut doc = Document::new(ADDRESS_TYPE, self.id());
        doc.set_attribute("ethereum-address", checksum_address(&self.address));
        doc.set_attribute("balance-wei", self.balance_wei.to_string());
        doc.set_relationship("transactions", Relationship::Many(self.transactions));
        if let Some(version) = self.version {
            doc.meta.block_height = Some(version.block_height);
            doc.meta.version = Some(version.to_string());
        }
        doc
    }

    /// Merge incoming transaction refs, keeping the list sorted by chain
    /// position and free of duplicate hashes. Returns true if anything was added.
    pub fn merge_transactions(&mut self, incoming: impl IntoIterator<Item = DocumentRef>) -> bool {
        let mut added = false;
        for tx in incoming {
            if self.transactions.iter().any(|known| known.same_target(&tx)) {
                continue;
            }
            self.transactions.push(tx);
            added = true;
        }

        if added {
            self.transactions
                .sort_by_key(|r| r.position.unwrap_or(ChainPosition {
                    block_number: u64::MAX,
                    transaction_index: u64::MAX,
                }));
        }
        added
    }

    pub fn block_height(&self) -> Option<u64> {
        self.version.map(|v| v.block_height)
    }

    pub fn record_update(&mut self, block_height: u64) {
        self.version = Some(DocumentVersion::next(self.version, block_height));
    }
}

/// Builds the immutable `ethereum-transactions` document
pub fn transaction_document(block: &Block, tx: &Transaction, receipt: &Receipt) -> Document {
    let hash = tx.hash.to_string().to_lowercase();
    let mut doc = Document::new(TRANSACTION_TYPE, hash.clone());

    doc.set_attribute("block-number", block.number);
    doc.set_attribute("block-hash", block.hash.to_string());
    doc.set_attribute("transaction-hash", hash);
    doc.set_attribute("transaction-nonce", tx.nonce);
    doc.set_attribute("transaction-index", tx.transaction_index.unwrap_or_default());
    doc.set_attribute("transaction-value", tx.value.to_string());
    doc.set_attribute("transaction-from", checksum_address(&tx.from));
    doc.set_attribute(
        "transaction-to",
        tx.to.as_ref().map(checksum_address).map(Value::String).unwrap_or(Value::Null),
    );
    doc.set_attribute("gas", tx.gas);
    doc.set_attribute(
        "gas-price",
        tx.gas_price.map(|p| p.to_string()).unwrap_or_else(|| "0".to_string()),
    );
    doc.set_attribute("transaction-successful", receipt.succeeded());
    doc.set_attribute("gas-used", receipt.gas_used);
    doc.set_attribute("cumulative-gas-used", receipt.cumulative_gas_used);
    doc.set_attribute("timestamp", block.timestamp);

    doc.set_relationship("from-address", Relationship::One(Some(address_ref(&tx.from))));
    doc.set_relationship(
        "to-address",
        Relationship::One(tx.to.as_ref().map(address_ref)),
    );

    doc.meta.block_height = Some(block.number);
    doc
}

pub fn position_of(tx: &Transaction, block: &Block) -> ChainPosition {
    ChainPosition {
        block_number: tx.block_number.unwrap_or(block.number),
        transaction_index: tx.transaction_index.unwrap_or_default(),
    }
}
