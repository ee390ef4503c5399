// Document model shared by the store, the indexers and the read API.

pub mod ethereum;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Chain position carried on refs to ordered records (transactions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainPosition {
    pub block_number: u64,
    pub transaction_index: u64,
}

/// Reference to a document by type and id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub id: String,
    #[serde(rename = "meta", default, skip_serializing_if = "Option::is_none")]
    pub position: Option<ChainPosition>,
}

impl DocumentRef {
    pub fn new(doc_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            doc_type: doc_type.into(),
            id: id.into(),
            position: None,
        }
    }

    pub fn at(mut self, position: ChainPosition) -> Self {
        self.position = Some(position);
        self
    }

    /// Two refs point at the same document regardless of their position
    pub fn same_target(&self, other: &DocumentRef) -> bool {
        self.doc_type == other.doc_type && self.id == other.id
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.doc_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Relationship {
    Many(Vec<DocumentRef>),
    One(Option<DocumentRef>),
}

impl Relationship {
    pub fn refs(&self) -> Vec<&DocumentRef> {
        match self {
            Relationship::Many(refs) => refs.iter().collect(),
            Relationship::One(Some(r)) => vec![r],
            Relationship::One(None) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A stored document: typed attributes live in a JSON map so that schema
/// derived at runtime (from an ABI) can flow through without new structs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, Relationship>,
    #[serde(default)]
    pub meta: DocumentMeta,
}

impl Document {
    pub fn new(doc_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            doc_type: doc_type.into(),
            id: id.into(),
            attributes: Map::new(),
            relationships: BTreeMap::new(),
            meta: DocumentMeta::default(),
        }
    }

    pub fn reference(&self) -> DocumentRef {
        DocumentRef::new(self.doc_type.clone(), self.id.clone())
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn set_relationship(&mut self, name: impl Into<String>, relationship: Relationship) {
        self.relationships.insert(name.into(), relationship);
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.get(name)
    }

    /// Appends `target` to a to-many relationship unless it is already present.
    /// Returns true when the relationship changed.
    pub fn add_to_many(&mut self, name: &str, target: DocumentRef) -> bool {
        let entry = self
            .relationships
            .entry(name.to_string())
            .or_insert_with(|| Relationship::Many(Vec::new()));

        match entry {
            Relationship::Many(refs) => {
                if refs.iter().any(|r| r.same_target(&target)) {
                    false
                } else {
                    refs.push(target);
                    true
                }
            }
            Relationship::One(_) => {
                *entry = Relationship::Many(vec![target]);
                true
            }
        }
    }
}

/// Hint passed to an update pass naming records that are likely dirty
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum Hint {
    Address(String),
    Contract(String),
    Document(DocumentRef),
}

/// Document types whose writes change the derived schema
pub const SCHEMA_TYPES: &[&str] = &["content-types", "fields", "grants", "data-sources"];

pub fn is_schema_type(doc_type: &str) -> bool {
    SCHEMA_TYPES.contains(&doc_type)
}
