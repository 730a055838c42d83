// SPDX-License-Identifier: Apache-2.0

//! MySQL driver.
//!
//! Accepts `mysql://` URLs or ADO-style key/value connection strings; the
//! latter are converted in `engine::connection`.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Executor, Row, Statement};

use super::{DataSource, RowSet};
use crate::engine::connection;
use crate::engine::dialect::SqlDialect;
use crate::engine::error::{EngineError, EngineResult};

pub struct MySqlSource {
    pool: MySqlPool,
}

impl MySqlSource {
    pub async fn open(conn_str: &str) -> EngineResult<Self> {
        let url = connection::database_url(SqlDialect::MySql, conn_str)?;
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        Ok(Self { pool })
    }

    fn extract_value(row: &MySqlRow, idx: usize) -> Option<String> {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(|i| i.to_string());
        }
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(|i| i.to_string());
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(|f| f.to_string());
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(|b| b.to_string());
        }
        if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
            return v.map(|d| d.to_string());
        }
        if let Ok(v) = row.try_get::<Option<bigdecimal::BigDecimal>, _>(idx) {
            return v.map(|d| d.to_string());
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v.map(|t| t.to_string());
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v.map(|d| d.to_string());
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v.map(|t| t.to_string());
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v;
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(|j| j.to_string());
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(|b| base64::engine::general_purpose::STANDARD.encode(b));
        }
        None
    }
}

#[async_trait]
impl DataSource for MySqlSource {
    async fn execute(&self, sql: &str) -> EngineResult<RowSet> {
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

        let rows: Vec<MySqlRow> = sqlx::query(sql)
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
