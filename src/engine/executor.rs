// SPDX-License-Identifier: Apache-2.0

//! Per-database query execution.
//!
//! Opens a connection through the dialect driver, enforces the row cap,
//! renders the tab-delimited result body, and masks sensitive columns.
//! The guard gate runs before any connection is opened.

use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DatabaseDescriptor;
use crate::engine::dialect::SqlDialect;
use crate::engine::drivers::{self, RowSet};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::guard;
use crate::engine::types::{
    DbResult, NULL_PLACEHOLDER, ROWS_EXTRACTED_PREFIX, SENSITIVE_PLACEHOLDER,
};

/// Executes one sub-plan's SQL against one database. Object-safe so the
/// orchestrator can be driven by a recording double in tests.
#[async_trait]
pub trait SubPlanExecutor: Send + Sync {
    async fn execute(
        &self,
        descriptor: &DatabaseDescriptor,
        sql: &str,
        requested_cap: Option<u32>,
        cancel: &CancellationToken,
    ) -> DbResult;
}

/// The production executor: one short-lived connection per query.
#[derive(Debug, Default)]
pub struct QueryExecutor;

impl QueryExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn run(
        descriptor: &DatabaseDescriptor,
        sql: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<RowSet> {
        let timeout = descriptor.query_timeout;
        let work = async {
            let source = drivers::open(descriptor).await?;
            let result = source.execute(sql).await;
            source.close().await;
            result
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            outcome = tokio::time::timeout(timeout, work) => match outcome {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
        }
    }

    /// Render the stable result body: tab-joined header, tab-joined rows
    /// with NULL and sensitive-value substitution, `Rows extracted: N`
    /// trailer.
    fn format_body(descriptor: &DatabaseDescriptor, rows: &RowSet, cap: u32) -> (String, u32) {
        let sensitive: Vec<bool> = rows
            .columns
            .iter()
            .map(|c| descriptor.is_sensitive_column(c))
            .collect();

        let mut body = String::new();
        body.push_str(&rows.columns.join("\t"));
        body.push('\n');

        let mut written: u32 = 0;
        for row in rows.rows.iter().take(cap as usize) {
            let line: Vec<String> = row
                .iter()
                .enumerate()
                .map(|(idx, cell)| match cell {
                    _ if sensitive.get(idx).copied().unwrap_or(false) => {
                        SENSITIVE_PLACEHOLDER.to_string()
                    }
                    Some(value) => value.clone(),
                    None => NULL_PLACEHOLDER.to_string(),
                })
                .collect();
            body.push_str(&line.join("\t"));
            body.push('\n');
            written += 1;
        }

        body.push_str(&format!("{} {}\n", ROWS_EXTRACTED_PREFIX, written));
        (body, written)
    }

    /// SQL Server refuses connections to a missing catalog with error 4060;
    /// an absent database is an empty database for planning purposes.
    fn is_missing_database(descriptor: &DatabaseDescriptor, message: &str) -> bool {
        descriptor.dialect == SqlDialect::SqlServer
            && (message.contains("4060") || message.contains("Cannot open database"))
    }
}

#[async_trait]
impl SubPlanExecutor for QueryExecutor {
    async fn execute(
        &self,
        descriptor: &DatabaseDescriptor,
        sql: &str,
        requested_cap: Option<u32>,
        cancel: &CancellationToken,
    ) -> DbResult {
        let started = Instant::now();
        let elapsed = |s: &Instant| s.elapsed().as_millis() as u64;

        // Refuse before any connection is opened.
        if let Err(err) = guard::ensure_select_only(descriptor.dialect, sql) {
            warn!(db = %descriptor.id, "query refused by guard: {}", err);
            return DbResult::failure(
                &descriptor.id,
                &descriptor.display_name,
                sql,
                err.to_string(),
                elapsed(&started),
            );
        }

        let cap = requested_cap
            .unwrap_or(descriptor.row_cap)
            .min(descriptor.row_cap);

        debug!(db = %descriptor.id, cap, "executing query");

        match Self::run(descriptor, sql, cancel).await {
            Ok(rows) => {
                let (body, written) = Self::format_body(descriptor, &rows, cap);
                DbResult {
                    db_id: descriptor.id.clone(),
                    display_name: descriptor.display_name.clone(),
                    executed_sql: sql.to_string(),
                    rows_extracted: written,
                    body,
                    ok: true,
                    error: None,
                    elapsed_millis: elapsed(&started),
                }
            }
            Err(err) => {
                let message = err.to_string();
                if Self::is_missing_database(descriptor, &message) {
                    let body = format!(
                        "Query: database unavailable (SQL Server error 4060); treated as empty\n{} 0\n",
                        ROWS_EXTRACTED_PREFIX
                    );
                    return DbResult {
                        db_id: descriptor.id.clone(),
                        display_name: descriptor.display_name.clone(),
                        executed_sql: sql.to_string(),
                        rows_extracted: 0,
                        body,
                        ok: true,
                        error: None,
                        elapsed_millis: elapsed(&started),
                    };
                }
                warn!(db = %descriptor.id, "query failed: {}", message);
                DbResult::failure(
                    &descriptor.id,
                    &descriptor.display_name,
                    sql,
                    message,
                    elapsed(&started),
                )
            }
        }
    }
}
