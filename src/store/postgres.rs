use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::{DocRef, Document, Fields, RecordStore, StoreError};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data JSONB NOT NULL,
    PRIMARY KEY (collection, id)
)";

/// Documents kept as JSONB rows of a single `documents` table.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await?;
        let store = Self::new(pool);
        store.ensure_table().await?;
        Ok(store)
    }

    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_document(collection: &str, row: &PgRow) -> Result<Document, StoreError> {
        let id: String = row.try_get("id")?;
        let data: Value = row.try_get("data")?;
        let reference = DocRef::new(collection, id);
        match data {
            Value::Object(fields) => Ok(Document::new(reference, fields)),
            _ => Err(StoreError::Corrupt(reference)),
        }
    }

    async fn write(&self, collection: &str, key: &str, fields: Fields) -> Result<u64, StoreError> {
        let res = sqlx::query(
            "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3)
             ON CONFLICT (collection, id) DO NOTHING",
        )
        .bind(collection)
        .bind(key)
        .bind(Value::Object(fields))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

/// `SELECT` for `query_eq`; filter `n` compares `data -> $(2n+2)` with `$(2n+3)`.
fn equality_query(filter_count: usize) -> String {
    let mut sql = String::from("SELECT id, data FROM documents WHERE collection = $1");
    for n in 0..filter_count {
        sql.push_str(&format!(
            " AND data -> ${}::text = ${}::jsonb",
            2 * n + 2,
            2 * n + 3
        ));
    }
    sql.push_str(&format!(" LIMIT ${}", 2 * filter_count + 2));
    sql
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT id, data FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Self::row_to_document(collection, &row))
            .transpose()
    }

    async fn create(&self, collection: &str, key: &str, fields: Fields) -> Result<(), StoreError> {
        if self.write(collection, key, fields).await? < 1 {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn insert(&self, collection: &str, fields: Fields) -> Result<DocRef, StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        if self.write(collection, &id, fields).await? < 1 {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                key: id,
            });
        }
        Ok(DocRef::new(collection, id))
    }

    async fn query_eq(
        &self,
        collection: &str,
        filters: &[(&str, Value)],
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let sql = equality_query(filters.len());
        let mut query = sqlx::query(&sql).bind(collection);
        for (field, value) in filters {
            query = query.bind(*field).bind(value.clone());
        }
        let rows = query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Self::row_to_document(collection, row))
            .collect()
    }
}
