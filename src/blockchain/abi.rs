//! Contract ABI access: getter classification, eth_call encoding and log decoding.

use crate::blockchain::models::Log;
use alloy_dyn_abi::{DynSolValue, EventExt, FunctionExt, JsonAbiExt};
use alloy_json_abi::{Event, Function, JsonAbi, StateMutability};
use alloy_primitives::{Address, Bytes, B256};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AbiError {
    #[error("Malformed ABI: {0}")]
    Malformed(String),

    #[error("ABI has no function named {0}")]
    MissingFunction(String),

    #[error("ABI has no event named {0}")]
    MissingEvent(String),

    #[error("Failed to encode call to {function}: {reason}")]
    Encode { function: String, reason: String },

    #[error("Failed to decode {item}: {reason}")]
    Decode { item: String, reason: String },
}

/// A decoded event argument, in ABI declaration order
#[derive(Debug, Clone)]
pub struct DecodedField {
    pub name: String,
    pub sol_type: String,
    pub value: DynSolValue,
}

#[derive(Debug, Clone)]
pub struct DecodedLog {
    pub event: Event,
    pub fields: Vec<DecodedField>,
}

impl DecodedLog {
    pub fn field(&self, name: &str) -> Option<&DecodedField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct ContractAbi {
    abi: JsonAbi,
}

impl ContractAbi {
    pub fn from_json(value: &Value) -> Result<Self, AbiError> {
        let abi: JsonAbi =
            serde_json::from_value(value.clone()).map_err(|e| AbiError::Malformed(e.to_string()))?;
        Ok(Self { abi })
    }

    pub fn inner(&self) -> &JsonAbi {
        &self.abi
    }

    pub fn function(&self, name: &str) -> Result<&Function, AbiError> {
        self.abi
            .function(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| AbiError::MissingFunction(name.to_string()))
    }

    pub fn event(&self, name: &str) -> Result<&Event, AbiError> {
        self.abi
            .event(name)
            .and_then(|overloads| overloads.first())
            .ok_or_else(|| AbiError::MissingEvent(name.to_string()))
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.abi.events()
    }

    /// Read-only getters without arguments: one contract attribute each
    pub fn state_getters(&self) -> Vec<&Function> {
        self.abi
            .functions()
            .filter(|f| is_read_only(f) && f.inputs.is_empty() && !f.outputs.is_empty())
            .collect()
    }

    /// Read-only getters with arguments: one mapping content type each
    pub fn mapping_getters(&self) -> Vec<&Function> {
        self.abi
            .functions()
            .filter(|f| is_read_only(f) && !f.inputs.is_empty() && !f.outputs.is_empty())
            .collect()
    }

    pub fn event_for_log(&self, log: &Log) -> Option<&Event> {
        let topic0 = log.topic0()?;
        self.abi
            .events()
            .find(|event| !event.anonymous && event.selector() == *topic0)
    }

    pub fn decode_log(&self, log: &Log) -> Result<Option<DecodedLog>, AbiError> {
        let Some(event) = self.event_for_log(log) else {
            return Ok(None);
        };

        let decoded = event
            .decode_log_parts(log.topics.iter().copied(), &log.data, true)
            .map_err(|e| AbiError::Decode {
                item: format!("{} log", event.name),
                reason: e.to_string(),
            })?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut fields = Vec::with_capacity(event.inputs.len());

        for input in &event.inputs {
            let value = if input.indexed { indexed.next() } else { body.next() };
            let value = value.ok_or_else(|| AbiError::Decode {
                item: format!("{} log", event.name),
                reason: format!("missing value for {}", input.name),
            })?;
            fields.push(DecodedField {
                name: input.name.clone(),
                sol_type: input.ty.clone(),
                value,
            });
        }

        Ok(Some(DecodedLog {
            event: event.clone(),
            fields,
        }))
    }
}

pub fn is_read_only(function: &Function) -> bool {
    matches!(
        function.state_mutability,
        StateMutability::View | StateMutability::Pure
    )
}

pub fn encode_call(function: &Function, args: &[DynSolValue]) -> Result<Bytes, AbiError> {
    function
        .abi_encode_input(args)
        .map(Bytes::from)
        .map_err(|e| AbiError::Encode {
            function: function.name.clone(),
            reason: e.to_string(),
        })
}

pub fn decode_output(function: &Function, data: &[u8]) -> Result<Vec<DynSolValue>, AbiError> {
    function
        .abi_decode_output(data, true)
        .map_err(|e| AbiError::Decode {
            item: format!("{} output", function.name),
            reason: e.to_string(),
        })
}

/// JSON representation stored in documents: integers as decimal strings,
/// addresses lower-cased, byte strings as 0x-hex.
pub fn to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Address(a) => Value::String(address_id(a)),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", alloy_primitives::hex::encode(b))),
        DynSolValue::FixedBytes(word, size) => Value::String(format!(
            "0x{}",
            alloy_primitives::hex::encode(&word[..*size])
        )),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(to_json).collect())
        }
        other => Value::String(format!("{:?}", other)),
    }
}

/// String form of a value used to build document ids
pub fn key_part(value: &DynSolValue) -> String {
    match to_json(value) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Lower-cased 0x address used as a document id
pub fn address_id(address: &Address) -> String {
    address.to_string().to_lowercase()
}

pub fn topic_for_address(address: &Address) -> B256 {
    address.into_word()
}
