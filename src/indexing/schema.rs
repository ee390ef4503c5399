//! Document type naming and content-type definitions derived from a contract ABI.

use crate::blockchain::abi::ContractAbi;
use crate::cache::schema::CONTENT_TYPE;
use crate::models::Document;
use alloy_json_abi::Function;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// `balanceOf` -> `balance-of`, `getURI` -> `get-uri`, `token_id` -> `token-id`
pub fn kebab_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == ' ' || c == '-' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            continue;
        }
        if c.is_ascii_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => next.is_some_and(|n| n.is_ascii_lowercase()),
                _ => false,
            };
            if boundary && !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }

    out.trim_end_matches('-').to_string()
}

pub fn pluralize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix('y') {
        if !stem.ends_with(['a', 'e', 'i', 'o', 'u']) && !stem.is_empty() {
            return format!("{}ies", stem);
        }
    }
    if word.ends_with('s') || word.ends_with('x') || word.ends_with("ch") || word.ends_with("sh") {
        return format!("{}es", word);
    }
    format!("{}s", word)
}

/// Type of the contract state document
pub fn contract_type(source_id: &str) -> String {
    pluralize(source_id)
}

pub fn mapping_type(source_id: &str, getter: &str) -> String {
    format!("{}-{}s", source_id, kebab_case(getter))
}

pub fn event_type(source_id: &str, event: &str) -> String {
    format!("{}-{}-events", source_id, kebab_case(event))
}

/// Relationship on mapping documents listing events of one kind
pub fn event_relationship(event: &str) -> String {
    format!("{}-events", kebab_case(event))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number,
    Boolean,
    Address,
    String,
}

impl ValueKind {
    pub fn of(sol_type: &str) -> Self {
        if sol_type.starts_with("uint") || sol_type.starts_with("int") {
            ValueKind::Number
        } else if sol_type == "bool" {
            ValueKind::Boolean
        } else if sol_type == "address" {
            ValueKind::Address
        } else {
            ValueKind::String
        }
    }

    pub fn field_type(self) -> &'static str {
        match self {
            ValueKind::Number => "string-encoded-number",
            ValueKind::Boolean => "boolean",
            ValueKind::Address => "case-insensitive",
            ValueKind::String => "string",
        }
    }

    /// Attribute holding a single-output mapping value
    pub fn mapping_attribute(self) -> &'static str {
        match self {
            ValueKind::Number => "mapping-number-value",
            ValueKind::Boolean => "mapping-boolean-value",
            ValueKind::Address | ValueKind::String => "mapping-string-value",
        }
    }
}

/// Attribute name for output `index` of a multi-output getter
pub fn output_attribute(function: &Function, index: usize) -> String {
    match function.outputs.get(index) {
        Some(output) if !output.name.is_empty() => kebab_case(&output.name),
        _ => format!("output-{}", index),
    }
}

fn field(name: impl Into<String>, field_type: &str) -> Value {
    json!({ "name": name.into(), "field-type": field_type })
}

fn content_type_document(source_id: &str, name: &str, fields: Vec<Value>, relationships: Vec<String>) -> Document {
    let mut doc = Document::new(CONTENT_TYPE, name);
    doc.set_attribute("data-source", source_id);
    doc.set_attribute("fields", Value::Array(fields));
    doc.set_attribute("relationships", json!(relationships));
    doc
}

/// Content types for the contract document, each mapping getter and each event.
/// `triggers` maps event names to the content types they refresh and is used
/// to list the event relationships of mapping types.
pub fn derive_content_types(
    source_id: &str,
    abi: &ContractAbi,
    triggers: &BTreeMap<String, Vec<String>>,
) -> Vec<Document> {
    let mut types = Vec::new();

    let mut contract_fields: Vec<Value> = abi
        .state_getters()
        .into_iter()
        .filter_map(|getter| {
            let output = getter.outputs.first()?;
            Some(field(kebab_case(&getter.name), ValueKind::of(&output.ty).field_type()))
        })
        .collect();
    contract_fields.push(field("ethereum-address", ValueKind::Address.field_type()));
    contract_fields.push(field("balance-wei", ValueKind::Number.field_type()));
    types.push(content_type_document(
        source_id,
        &contract_type(source_id),
        contract_fields,
        vec!["data-source".to_string()],
    ));

    for getter in abi.mapping_getters() {
        let type_name = mapping_type(source_id, &getter.name);
        let mut fields = Vec::new();

        if getter.outputs.len() == 1 {
            let kind = ValueKind::of(&getter.outputs[0].ty);
            fields.push(field(kind.mapping_attribute(), kind.field_type()));
        } else {
            for (index, output) in getter.outputs.iter().enumerate() {
                fields.push(field(
                    output_attribute(getter, index),
                    ValueKind::of(&output.ty).field_type(),
                ));
            }
        }
        if getter.inputs.len() == 1 && getter.inputs[0].ty == "address" {
            fields.push(field("ethereum-address", ValueKind::Address.field_type()));
        }

        let mut relationships = vec!["contract".to_string()];
        relationships.extend(
            triggers
                .iter()
                .filter(|(_, types)| types.contains(&type_name))
                .map(|(event, _)| event_relationship(event)),
        );
        types.push(content_type_document(source_id, &type_name, fields, relationships));
    }

    for event in abi.events() {
        let mut fields = vec![
            field("block-number", ValueKind::Number.field_type()),
            field("transaction-hash", ValueKind::String.field_type()),
            field("event-name", ValueKind::String.field_type()),
        ];
        for input in &event.inputs {
            fields.push(field(kebab_case(&input.name), ValueKind::of(&input.ty).field_type()));
        }
        types.push(content_type_document(
            source_id,
            &event_type(source_id, &event.name),
            fields,
            vec!["contract".to_string()],
        ));
    }

    types
}
