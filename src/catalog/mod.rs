// SPDX-License-Identifier: Apache-2.0

//! Schema catalog.
//!
//! Introspects each configured database once, caches the structural snapshot
//! keyed by descriptor id, and guards concurrent first-time analyses with a
//! per-key single-flight cell. Cache invalidation is deliberately absent.

pub mod introspect;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DatabaseDescriptor;
use crate::docstore::{Document, DocumentStore};
use crate::engine::connection;
use crate::engine::dialect::SqlDialect;
use crate::engine::drivers;
use crate::engine::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub max_length: Option<u32>,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub local_column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    /// `schema.table` on engines with schema namespaces, bare name elsewhere.
    pub qualified_name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub approx_row_count: u64,
    pub sample_rows: Vec<Vec<Option<String>>>,
}

impl TableSchema {
    /// The unqualified table name.
    pub fn short_name(&self) -> &str {
        self.qualified_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.qualified_name)
    }

    /// True when `name` matches the qualified or short name, case-insensitive.
    pub fn matches_name(&self, name: &str) -> bool {
        self.qualified_name.eq_ignore_ascii_case(name)
            || self.short_name().eq_ignore_ascii_case(name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub db_id: String,
    pub display_name: String,
    pub dialect: SqlDialect,
    /// Canonical database (catalog) name extracted from the connection.
    pub catalog_name: String,
    pub tables: Vec<TableSchema>,
    pub total_row_count: u64,
    pub status: SnapshotStatus,
    pub last_analyzed: DateTime<Utc>,
    pub error: Option<String>,
}

impl SchemaSnapshot {
    /// Look a table up by qualified or short name, case-insensitive.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.matches_name(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }
}

/// Caches one snapshot per descriptor id.
pub struct SchemaCatalog {
    cache: RwLock<HashMap<String, Arc<SchemaSnapshot>>>,
    inflight: Mutex<HashMap<String, Arc<OnceCell<Arc<SchemaSnapshot>>>>>,
    docstore: Option<Arc<dyn DocumentStore>>,
}

impl SchemaCatalog {
    pub fn new(docstore: Option<Arc<dyn DocumentStore>>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            docstore,
        }
    }

    /// Cached snapshot for a descriptor, analysing on first use. Concurrent
    /// first-time calls for the same id share one analysis.
    pub async fn snapshot(
        &self,
        descriptor: &DatabaseDescriptor,
        cancel: &CancellationToken,
    ) -> EngineResult<Arc<SchemaSnapshot>> {
        if let Some(snapshot) = self.cache.read().await.get(&descriptor.id) {
            return Ok(snapshot.clone());
        }

        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(descriptor.id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let snapshot = cell
            .get_or_try_init(|| async {
                let snapshot = Arc::new(Self::analyze(descriptor, cancel).await?);
                self.cache
                    .write()
                    .await
                    .insert(descriptor.id.clone(), snapshot.clone());
                self.persist_chunk(&snapshot).await;
                Ok::<_, EngineError>(snapshot)
            })
            .await?
            .clone();

        Ok(snapshot)
    }

    /// Every snapshot analysed so far.
    pub async fn all(&self) -> Vec<Arc<SchemaSnapshot>> {
        self.cache.read().await.values().cloned().collect()
    }

    async fn analyze(
        descriptor: &DatabaseDescriptor,
        cancel: &CancellationToken,
    ) -> EngineResult<SchemaSnapshot> {
        info!(db = %descriptor.id, dialect = %descriptor.dialect.name(), "analysing schema");

        let work = Self::analyze_inner(descriptor);
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            snapshot = work => Ok(snapshot),
        }
    }

    async fn analyze_inner(descriptor: &DatabaseDescriptor) -> SchemaSnapshot {
        let catalog_name = connection::catalog_name(
            descriptor.dialect,
            descriptor.connection_string.expose(),
        );
        let mut snapshot = SchemaSnapshot {
            db_id: descriptor.id.clone(),
            display_name: descriptor.display_name.clone(),
            dialect: descriptor.dialect,
            catalog_name,
            tables: Vec::new(),
            total_row_count: 0,
            status: SnapshotStatus::InProgress,
            last_analyzed: Utc::now(),
            error: None,
        };

        let source = match drivers::open(descriptor).await {
            Ok(source) => source,
            Err(err) => {
                let message = err.to_string();
                if is_missing_database(&message) {
                    // An absent database is an empty database: still routable.
                    debug!(db = %descriptor.id, "database missing; returning empty snapshot");
                    snapshot.status = SnapshotStatus::Completed;
                } else {
                    warn!(db = %descriptor.id, "schema analysis failed to connect: {}", message);
                    snapshot.status = SnapshotStatus::Failed;
                    snapshot.error = Some(message);
                }
                return snapshot;
            }
        };

        match introspect::tables(source.as_ref(), descriptor).await {
            Ok(tables) => {
                snapshot.tables = filter_tables(tables, descriptor);
                snapshot.total_row_count =
                    snapshot.tables.iter().map(|t| t.approx_row_count).sum();
                snapshot.status = SnapshotStatus::Completed;
            }
            Err(err) => {
                // Partial data still counts; only a completely empty
                // enumeration is a failure.
                warn!(db = %descriptor.id, "introspection error: {}", err);
                snapshot.status = if snapshot.tables.is_empty() {
                    SnapshotStatus::Failed
                } else {
                    SnapshotStatus::Completed
                };
                snapshot.error = Some(err.to_string());
            }
        }

        source.close().await;
        snapshot.last_analyzed = Utc::now();
        snapshot
    }

    async fn persist_chunk(&self, snapshot: &SchemaSnapshot) {
        let Some(store) = &self.docstore else { return };
        let mut content = String::new();
        for table in &snapshot.tables {
            let cols: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
            content.push_str(&format!("{}({})\n", table.qualified_name, cols.join(", ")));
        }
        store
            .add(Document::schema_chunk(&snapshot.db_id, content))
            .await;
    }
}

/// Apply `included_tables` (when non-empty, keep only these), then
/// `excluded_tables`. Both match the short or qualified name.
fn filter_tables(tables: Vec<TableSchema>, descriptor: &DatabaseDescriptor) -> Vec<TableSchema> {
    let matches = |table: &TableSchema, names: &[String]| {
        names.iter().any(|n| table.matches_name(n))
    };
    tables
        .into_iter()
        .filter(|t| {
            descriptor.included_tables.is_empty() || matches(t, &descriptor.included_tables)
        })
        .filter(|t| !matches(t, &descriptor.excluded_tables))
        .collect()
}

fn is_missing_database(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("does not exist")
        || lower.contains("unknown database")
        || lower.contains("cannot open database")
        || lower.contains("4060")
        || lower.contains("unable to open database file")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn descriptor(conn: &str, included: Vec<String>, excluded: Vec<String>) -> DatabaseDescriptor {
        DatabaseDescriptor::from_settings(DatabaseSettings {
            name: Some("library".to_string()),
            dialect: "sqlite".to_string(),
            connection_string: conn.to_string(),
            max_rows_per_query: 100,
            included_tables: included,
            excluded_tables: excluded,
            sensitive_columns: vec![],
            query_timeout_seconds: 30,
            cross_database_mappings: vec![],
        })
        .unwrap()
    }

    async fn seed_library(path: &std::path::Path) {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .unwrap()
            .create_if_missing(true);
        let pool = sqlx::SqlitePool::connect_with(opts).await.unwrap();
        sqlx::query("CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT, author_id INTEGER, \
             FOREIGN KEY (author_id) REFERENCES authors(id))",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("CREATE TABLE scratch (k TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO authors (name) VALUES ('Le Guin'), ('Borges')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO books (title, author_id) VALUES ('Ficciones', 2)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn snapshot_captures_structure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.db");
        seed_library(&path).await;

        let catalog = SchemaCatalog::new(None);
        let descriptor = descriptor(&path.to_string_lossy(), vec![], vec![]);
        let cancel = CancellationToken::new();
        let snapshot = catalog.snapshot(&descriptor, &cancel).await.unwrap();

        assert_eq!(snapshot.status, SnapshotStatus::Completed);
        assert!(snapshot.has_table("books"));
        assert!(snapshot.has_table("AUTHORS"));

        let books = snapshot.table("books").unwrap();
        assert!(books.has_column("title"));
        assert_eq!(books.primary_keys, vec!["id"]);
        assert_eq!(books.foreign_keys.len(), 1);
        assert_eq!(books.foreign_keys[0].referenced_table, "authors");
        assert_eq!(books.foreign_keys[0].local_column, "author_id");
        assert_eq!(books.approx_row_count, 1);

        let authors = snapshot.table("authors").unwrap();
        assert_eq!(authors.approx_row_count, 2);
        assert_eq!(authors.sample_rows.len(), 2);
    }

    #[tokio::test]
    async fn include_exclude_filters_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.db");
        seed_library(&path).await;
        let cancel = CancellationToken::new();

        let catalog = SchemaCatalog::new(None);
        let only_books = descriptor(
            &path.to_string_lossy(),
            vec!["books".to_string()],
            vec![],
        );
        let snapshot = catalog.snapshot(&only_books, &cancel).await.unwrap();
        assert_eq!(snapshot.tables.len(), 1);
        assert!(snapshot.has_table("books"));

        let catalog = SchemaCatalog::new(None);
        let mut no_scratch = descriptor(&path.to_string_lossy(), vec![], vec!["SCRATCH".to_string()]);
        no_scratch.id = "library2".to_string();
        let snapshot = catalog.snapshot(&no_scratch, &cancel).await.unwrap();
        assert_eq!(snapshot.tables.len(), 2);
        assert!(!snapshot.has_table("scratch"));
    }

    #[tokio::test]
    async fn concurrent_first_use_shares_one_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flight.db");
        seed_library(&path).await;

        static CALLS: AtomicUsize = AtomicUsize::new(0);

        // Count analyses indirectly: every snapshot carries last_analyzed,
        // and a shared analysis yields pointer-identical Arcs.
        let catalog = Arc::new(SchemaCatalog::new(None));
        let descriptor = Arc::new(descriptor(&path.to_string_lossy(), vec![], vec![]));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let catalog = catalog.clone();
            let descriptor = descriptor.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                CALLS.fetch_add(1, Ordering::SeqCst);
                catalog.snapshot(&descriptor, &cancel).await.unwrap()
            }));
        }

        let mut snapshots = Vec::new();
        for handle in handles {
            snapshots.push(handle.await.unwrap());
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 8);
        let first = &snapshots[0];
        assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, first)));
    }

    #[tokio::test]
    async fn missing_database_yields_empty_completed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");

        let catalog = SchemaCatalog::new(None);
        let descriptor = descriptor(&path.to_string_lossy(), vec![], vec![]);
        let cancel = CancellationToken::new();
        let snapshot = catalog.snapshot(&descriptor, &cancel).await.unwrap();

        assert_eq!(snapshot.status, SnapshotStatus::Completed);
        assert!(snapshot.tables.is_empty());
    }

    #[tokio::test]
    async fn schema_chunk_is_persisted() {
        use crate::docstore::InMemoryDocumentStore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.db");
        seed_library(&path).await;

        let store = Arc::new(InMemoryDocumentStore::new());
        let catalog = SchemaCatalog::new(Some(store.clone()));
        let descriptor = descriptor(&path.to_string_lossy(), vec![], vec![]);
        let cancel = CancellationToken::new();
        catalog.snapshot(&descriptor, &cancel).await.unwrap();

        let chunks = store.schema_chunks("library").await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("books"));
    }
}
