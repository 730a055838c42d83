// SPDX-License-Identifier: Apache-2.0

//! Document repository collaborator.
//!
//! The catalog persists one schema chunk per analysed database so an outer
//! retrieval service can serve structural context without re-introspecting.
//! The trait mirrors the external repository; the in-memory store backs
//! tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

pub const SCHEMA_DOCUMENT_TYPE: &str = "Schema";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub document_type: String,
    pub database_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn schema_chunk(database_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_type: SCHEMA_DOCUMENT_TYPE.to_string(),
            database_id: Some(database_id.into()),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn add(&self, doc: Document);
    async fn get_all(&self) -> Vec<Document>;
    async fn get_by_id(&self, id: Uuid) -> Option<Document>;
    async fn delete(&self, id: Uuid) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<HashMap<Uuid, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema chunks for a database, newest first.
    pub async fn schema_chunks(&self, database_id: &str) -> Vec<Document> {
        let docs = self.docs.read().await;
        let mut chunks: Vec<Document> = docs
            .values()
            .filter(|d| {
                d.document_type == SCHEMA_DOCUMENT_TYPE
                    && d.database_id.as_deref() == Some(database_id)
            })
            .cloned()
            .collect();
        chunks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        chunks
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn add(&self, doc: Document) {
        self.docs.write().await.insert(doc.id, doc);
    }

    async fn get_all(&self) -> Vec<Document> {
        self.docs.read().await.values().cloned().collect()
    }

    async fn get_by_id(&self, id: Uuid) -> Option<Document> {
        self.docs.read().await.get(&id).cloned()
    }

    async fn delete(&self, id: Uuid) -> bool {
        self.docs.write().await.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_get_delete_round_trip() {
        let store = InMemoryDocumentStore::new();
        let doc = Document::schema_chunk("sales", "orders(id, total)");
        let id = doc.id;
        store.add(doc).await;

        assert_eq!(store.get_all().await.len(), 1);
        assert!(store.get_by_id(id).await.is_some());
        assert_eq!(store.schema_chunks("sales").await.len(), 1);
        assert!(store.schema_chunks("crm").await.is_empty());

        assert!(store.delete(id).await);
        assert!(!store.delete(id).await);
        assert!(store.get_all().await.is_empty());
    }
}
