// SPDX-License-Identifier: Apache-2.0

//! SQLite driver.
//!
//! File-based engine: the connection string is (or contains) a path, which
//! goes through the traversal guard in `engine::connection` before a pool is
//! opened. `:memory:` is supported for tests and scratch fleets.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, Statement};

use super::{DataSource, RowSet};
use crate::engine::connection;
use crate::engine::error::{EngineError, EngineResult};

pub struct SqliteSource {
    pool: SqlitePool,
}

impl SqliteSource {
    pub async fn open(conn_str: &str) -> EngineResult<Self> {
        let path = connection::sqlite_path(conn_str)?;

        let opts = if path.as_os_str() == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| EngineError::connection_failed(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(false)
        }
        .busy_timeout(Duration::from_secs(30))
        .read_only(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// SQLite has dynamic typing; try the likely types in order.
    fn extract_value(row: &SqliteRow, idx: usize) -> Option<String> {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(|i| i.to_string());
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(|f| f.to_string());
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v;
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(|b| base64::engine::general_purpose::STANDARD.encode(b));
        }
        None
    }
}

#[async_trait]
impl DataSource for SqliteSource {
    async fn execute(&self, sql: &str) -> EngineResult<RowSet> {
        // Prepare first so the header survives empty results.
        let statement = self
            .pool
            .prepare(sql)
            .await
            .map_err(|e| EngineError::execution(e.to_string()))?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows: Vec<SqliteRow> = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::execution(e.to_string()))?;

        let rows = rows
            .iter()
            .map(|row| {
                (0..columns.len())
                    .map(|idx| Self::extract_value(row, idx))
                    .collect()
            })
            .collect();

        Ok(RowSet { columns, rows })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_database_round_trip() {
        let source = SqliteSource::open(":memory:").await.unwrap();
        source
            .execute("SELECT 1 AS one, 'x' AS label, NULL AS nothing")
            .await
            .map(|rows| {
                assert_eq!(rows.columns, vec!["one", "label", "nothing"]);
                assert_eq!(rows.rows.len(), 1);
                assert_eq!(rows.rows[0][0].as_deref(), Some("1"));
                assert_eq!(rows.rows[0][1].as_deref(), Some("x"));
                assert_eq!(rows.rows[0][2], None);
            })
            .unwrap();
        source.close().await;
    }

    #[tokio::test]
    async fn header_survives_empty_result() {
        let source = SqliteSource::open(":memory:").await.unwrap();
        let rows = source
            .execute("SELECT 1 AS id WHERE 1 = 0")
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["id"]);
        assert!(rows.rows.is_empty());
        source.close().await;
    }

    #[tokio::test]
    async fn missing_file_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");
        let result = SqliteSource::open(&path.to_string_lossy()).await;
        assert!(matches!(
            result,
            Err(EngineError::ConnectionFailed { .. })
        ));
    }
}
