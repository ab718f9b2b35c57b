use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DocRef, Document, Fields, RecordStore, StoreError};

/// Process-local store. Documents within a collection are kept in id order,
/// which is the order `query_eq` scans them in.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Fields>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a document under a caller-chosen id, replacing any existing one.
    pub async fn put(&self, collection: &str, key: &str, fields: Fields) -> DocRef {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), fields);
        DocRef::new(collection, key)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .map(|fields| Document::new(DocRef::new(collection, key), fields.clone())))
    }

    async fn create(&self, collection: &str, key: &str, fields: Fields) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(key) {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        docs.insert(key.to_string(), fields);
        Ok(())
    }

    async fn insert(&self, collection: &str, fields: Fields) -> Result<DocRef, StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        Ok(self.put(collection, &id, fields).await)
    }

    async fn query_eq(
        &self,
        collection: &str,
        filters: &[(&str, Value)],
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read().await;
        let docs = match collections.get(collection) {
            Some(docs) => docs,
            None => return Ok(Vec::new()),
        };
        Ok(docs
            .iter()
            .filter(|(_, fields)| {
                filters
                    .iter()
                    .all(|(name, expected)| fields.get(*name) == Some(expected))
            })
            .take(limit)
            .map(|(id, fields)| Document::new(DocRef::new(collection, id.as_str()), fields.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::testing::fields;
    use super::*;

    #[tokio::test]
    async fn test_create_rejects_existing_key() {
        let store = MemoryRecordStore::new();
        store
            .create("accounts", "a@x.com", fields(json!({ "email": "a@x.com" })))
            .await
            .unwrap();

        let err = store
            .create("accounts", "a@x.com", fields(json!({ "email": "other" })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let doc = store.get("accounts", "a@x.com").await.unwrap().unwrap();
        assert_eq!(doc.field("email").unwrap(), &json!("a@x.com"));
    }

    #[tokio::test]
    async fn test_query_eq_matches_all_filters_and_limits() {
        let store = MemoryRecordStore::new();
        for (id, last) in [("1", "Lovelace"), ("2", "Byron"), ("3", "Lovelace")] {
            let student = fields(json!({ "firstName": "Ada", "lastName": last }));
            store.put("students", id, student).await;
        }

        let hits = store
            .query_eq(
                "students",
                &[("firstName", json!("Ada")), ("lastName", json!("Lovelace"))],
                10,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        let first = store
            .query_eq(
                "students",
                &[("firstName", json!("Ada")), ("lastName", json!("Lovelace"))],
                1,
            )
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let none = store
            .query_eq("students", &[("firstName", json!("ada"))], 1)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_insert_then_resolve() {
        let store = MemoryRecordStore::new();
        let reference = store
            .insert("teachers", fields(json!({ "firstName": "Grace" })))
            .await
            .unwrap();
        let doc = store.resolve(&reference).await.unwrap();
        assert_eq!(doc.reference, reference);

        let dangling = DocRef::new("teachers", "gone");
        assert!(matches!(
            store.resolve(&dangling).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
