// SPDX-License-Identifier: Apache-2.0

//! Database drivers.
//!
//! Every engine is reduced to one contract: `execute(sql) → RowSet`, with
//! all values rendered as strings and SQL NULL kept distinguishable. The
//! planner core never sees driver-native types.

pub mod mysql;
pub mod postgres;
pub mod sqlite;
pub mod sqlserver;

use async_trait::async_trait;

use crate::config::DatabaseDescriptor;
use crate::engine::dialect::SqlDialect;
use crate::engine::error::EngineResult;

/// Uniform query result: a header plus stringified rows.
/// `None` cells are SQL NULL.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl RowSet {
    /// Index of a column by case-insensitive name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// All non-null, non-empty values of one column.
    pub fn column_values(&self, name: &str) -> Vec<String> {
        let Some(idx) = self.column_index(name) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| row.get(idx).cloned().flatten())
            .filter(|v| !v.is_empty() && v != "NULL")
            .collect()
    }
}

/// An open connection (or small pool) against one database.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn execute(&self, sql: &str) -> EngineResult<RowSet>;
    async fn close(&self);
}

/// Open a data source for a descriptor, dispatching on its dialect.
pub async fn open(descriptor: &DatabaseDescriptor) -> EngineResult<Box<dyn DataSource>> {
    let conn = descriptor.connection_string.expose();
    match descriptor.dialect {
        SqlDialect::Sqlite => Ok(Box::new(sqlite::SqliteSource::open(conn).await?)),
        SqlDialect::MySql => Ok(Box::new(mysql::MySqlSource::open(conn).await?)),
        SqlDialect::Postgres => Ok(Box::new(postgres::PostgresSource::open(conn).await?)),
        SqlDialect::SqlServer => Ok(Box::new(sqlserver::SqlServerSource::open(conn).await?)),
    }
}
