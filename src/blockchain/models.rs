//! JSON-RPC wire types for the Ethereum endpoints we talk to.
//!
//! Quantities arrive as `0x`-prefixed hex strings; the `quantity` helpers
//! turn them into plain `u64`s so the rest of the crate never sees `U64`.

use alloy_primitives::{Address, Bytes, B256, U256, U64};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

mod quantity {
    use alloy_primitives::U64;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        U64::from(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        U64::deserialize(deserializer).map(|v| v.to::<u64>())
    }

    pub mod opt {
        use alloy_primitives::U64;
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
            value.map(U64::from).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
            Option::<U64>::deserialize(deserializer).map(|v| v.map(|v| v.to::<u64>()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(with = "quantity")]
    pub number: u64,
    pub hash: B256,
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: B256,
    #[serde(with = "quantity")]
    pub nonce: u64,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default, with = "quantity::opt")]
    pub block_number: Option<u64>,
    #[serde(default, with = "quantity::opt")]
    pub transaction_index: Option<u64>,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    pub value: U256,
    #[serde(with = "quantity")]
    pub gas: u64,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub input: Bytes,
}

impl Transaction {
    /// True when `address` is the sender or the recipient
    pub fn involves(&self, address: &Address) -> bool {
        self.from == *address || self.to.as_ref() == Some(address)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: B256,
    #[serde(default, with = "quantity::opt")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub status: Option<U64>,
    #[serde(with = "quantity")]
    pub gas_used: u64,
    #[serde(with = "quantity")]
    pub cumulative_gas_used: u64,
}

impl Receipt {
    /// Pre-byzantium receipts carry no status; treat them as successful
    pub fn succeeded(&self) -> bool {
        self.status.map(|s| s.to::<u64>() == 1).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default, with = "quantity::opt")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default, with = "quantity::opt")]
    pub transaction_index: Option<u64>,
    #[serde(default, with = "quantity::opt")]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub removed: bool,
}

impl Log {
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }

    /// Sort key placing logs in chain order
    pub fn position(&self) -> (u64, u64) {
        (self.block_number.unwrap_or_default(), self.log_index.unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Latest,
    Number(u64),
    Hash(B256),
}

impl BlockId {
    pub fn to_param(&self) -> Value {
        match self {
            BlockId::Latest => json!("latest"),
            BlockId::Number(n) => json!(format!("{:#x}", n)),
            BlockId::Hash(h) => json!(h.to_string()),
        }
    }
}

impl From<u64> for BlockId {
    fn from(number: u64) -> Self {
        BlockId::Number(number)
    }
}

/// Address/topic filter for `eth_getLogs` and log subscriptions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    pub topics: Vec<B256>,
}

impl LogFilter {
    pub fn for_address(address: Address) -> Self {
        Self {
            addresses: vec![address],
            topics: Vec::new(),
        }
    }

    pub fn to_param(&self, from_block: u64, to_block: u64) -> Value {
        let mut filter = json!({
            "fromBlock": format!("{:#x}", from_block),
            "toBlock": format!("{:#x}", to_block),
        });
        if !self.addresses.is_empty() {
            filter["address"] = json!(self.addresses);
        }
        if !self.topics.is_empty() {
            // Only topic0 alternatives are supported
            filter["topics"] = json!([self.topics]);
        }
        filter
    }
}

/// New block delivered by a block subscription, with the tracked addresses it touches
#[derive(Debug, Clone)]
pub struct BlockNotification {
    pub block: Block,
    pub touched: Vec<Address>,
}
