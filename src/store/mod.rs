//! Document store abstraction.
//!
//! Records live in named collections as JSON objects keyed by an id. A field
//! may hold a reference to another document, encoded as `{"$ref": "collection/id"}`.
//! Components receive an `Arc<dyn RecordStore>` at construction.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

/// Key under which a reference stores its target path.
pub const REF_KEY: &str = "$ref";

pub type Fields = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document `{collection}/{key}` already exists")]
    AlreadyExists { collection: String, key: String },

    #[error("document `{0}` does not exist")]
    NotFound(DocRef),

    #[error("document `{0}` is not a JSON object")]
    Corrupt(DocRef),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Serializes a record into document fields. Only types that serialize to a
/// JSON object are accepted.
pub fn to_fields<T: Serialize>(record: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(record)? {
        Value::Object(fields) => Ok(fields),
        other => Err(StoreError::Serialization(serde::ser::Error::custom(format!(
            "expected an object, got `{}`",
            other
        )))),
    }
}

/// Points at a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocRef {
    pub collection: String,
    pub id: String,
}

impl DocRef {
    pub fn new<C: Into<String>, I: Into<String>>(collection: C, id: I) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// The stored form of this reference, suitable for placing in a field.
    pub fn to_value(&self) -> Value {
        json!({ REF_KEY: self.to_string() })
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

impl FromStr for DocRef {
    type Err = ();

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        match path.split_once('/') {
            Some((collection, id))
                if !collection.is_empty() && !id.is_empty() && !id.contains('/') =>
            {
                Ok(DocRef::new(collection, id))
            }
            _ => Err(()),
        }
    }
}

/// One slot of a reference array after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefEntry {
    Valid(DocRef),
    Malformed,
}

impl From<&Value> for RefEntry {
    fn from(value: &Value) -> Self {
        let path = match value {
            Value::Object(map) if map.len() == 1 => map.get(REF_KEY).and_then(Value::as_str),
            _ => None,
        };
        path.and_then(|p| p.parse().ok())
            .map(RefEntry::Valid)
            .unwrap_or(RefEntry::Malformed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("field `{0}` is missing")]
    Missing(String),

    #[error("field `{field}` is not {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },
}

/// A document as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub reference: DocRef,
    pub fields: Fields,
}

impl Document {
    pub fn new(reference: DocRef, fields: Fields) -> Self {
        Self { reference, fields }
    }

    pub fn field(&self, name: &str) -> Result<&Value, FieldError> {
        self.fields
            .get(name)
            .ok_or_else(|| FieldError::Missing(name.to_string()))
    }

    /// Reads an array-of-references field. Individual slots are decoded but
    /// never rejected; a non-array value is a `WrongType` error.
    pub fn references(&self, name: &str) -> Result<Vec<RefEntry>, FieldError> {
        match self.field(name)? {
            Value::Array(items) => Ok(items.iter().map(RefEntry::from).collect()),
            _ => Err(FieldError::WrongType {
                field: name.to_string(),
                expected: "an array of references",
            }),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Point lookup by key.
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError>;

    /// Writes a document under `key` only if none exists, atomically.
    /// Fails with `StoreError::AlreadyExists` otherwise.
    async fn create(&self, collection: &str, key: &str, fields: Fields) -> Result<(), StoreError>;

    /// Writes a document under a store-generated id. No route writes
    /// students or teachers; this is how fixtures and seeding scripts
    /// populate those collections.
    async fn insert(&self, collection: &str, fields: Fields) -> Result<DocRef, StoreError>;

    /// Documents whose fields equal every `(field, value)` pair, at most `limit`
    /// of them. Result order is unspecified.
    async fn query_eq(
        &self,
        collection: &str,
        filters: &[(&str, Value)],
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    /// Fetches the document a reference points at.
    async fn resolve(&self, reference: &DocRef) -> Result<Document, StoreError> {
        self.get(&reference.collection, &reference.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(reference.clone()))
    }
}
