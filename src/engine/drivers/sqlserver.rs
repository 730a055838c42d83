// SPDX-License-Identifier: Apache-2.0

//! SQL Server driver.
//!
//! TDS protocol via Tiberius, pooled with bb8. Server errors carry their
//! numeric code in the message so the executor can recognise error 4060
//! ("Cannot open database") and downgrade it.

use async_trait::async_trait;
use bb8::Pool;
use bb8_tiberius::ConnectionManager;
use futures::TryStreamExt;
use tiberius::Row as TdsRow;

use super::{DataSource, RowSet};
use crate::engine::connection;
use crate::engine::error::{EngineError, EngineResult};

type MssqlPool = Pool<ConnectionManager>;

pub struct SqlServerSource {
    pool: MssqlPool,
}

impl SqlServerSource {
    pub async fn open(conn_str: &str) -> EngineResult<Self> {
        let config = connection::sqlserver_config(conn_str)?;
        let mgr = ConnectionManager::new(config);
        let pool = Pool::builder()
            .max_size(2)
            .connection_timeout(std::time::Duration::from_secs(30))
            .build(mgr)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        Ok(Self { pool })
    }

    fn map_error(err: tiberius::error::Error) -> EngineError {
        match err {
            tiberius::error::Error::Server(token) => EngineError::execution(format!(
                "error {}: {}",
                token.code(),
                token.message()
            )),
            other => EngineError::execution(other.to_string()),
        }
    }

    /// TDS rows are strongly typed; try the likely types in order.
    fn extract_value(row: &TdsRow, idx: usize) -> Option<String> {
        if let Ok(v) = row.try_get::<&str, _>(idx) {
            return v.map(str::to_string);
        }
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return v.map(|i| i.to_string());
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return v.map(|i| i.to_string());
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return v.map(|i| i.to_string());
        }
        if let Ok(v) = row.try_get::<u8, _>(idx) {
            return v.map(|i| i.to_string());
        }
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return v.map(|f| f.to_string());
        }
        if let Ok(v) = row.try_get::<f32, _>(idx) {
            return v.map(|f| f.to_string());
        }
        if let Ok(v) = row.try_get::<bool, _>(idx) {
            return v.map(|b| b.to_string());
        }
        if let Ok(v) = row.try_get::<tiberius::numeric::Numeric, _>(idx) {
            return v.map(|n| n.to_string());
        }
        if let Ok(v) = row.try_get::<chrono::NaiveDateTime, _>(idx) {
            return v.map(|t| t.to_string());
        }
        if let Ok(v) = row.try_get::<chrono::NaiveDate, _>(idx) {
            return v.map(|d| d.to_string());
        }
        if let Ok(v) = row.try_get::<chrono::NaiveTime, _>(idx) {
            return v.map(|t| t.to_string());
        }
        if let Ok(v) = row.try_get::<uuid::Uuid, _>(idx) {
            return v.map(|u| u.to_string());
        }
        None
    }
}

#[async_trait]
impl DataSource for SqlServerSource {
    async fn execute(&self, sql: &str) -> EngineResult<RowSet> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        let mut stream = conn
            .simple_query(sql)
            .await
            .map_err(Self::map_error)?;

        let columns: Vec<String> = stream
            .columns()
            .await
            .map_err(Self::map_error)?
            .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let mut rows = Vec::new();
        while let Some(item) = stream.try_next().await.map_err(Self::map_error)? {
            if let tiberius::QueryItem::Row(row) = item {
                let values = (0..columns.len().max(row.len()))
                    .map(|idx| Self::extract_value(&row, idx))
                    .collect();
                rows.push(values);
            }
        }

        Ok(RowSet { columns, rows })
    }

    async fn close(&self) {
        // bb8 drops pooled connections when the pool is dropped.
    }
}
