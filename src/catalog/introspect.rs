// SPDX-License-Identifier: Apache-2.0

//! Per-dialect schema introspection.
//!
//! Each engine exposes its structure through a different system catalog:
//! `sqlite_master` + PRAGMAs, `INFORMATION_SCHEMA` (MySQL scoped to
//! `DATABASE()`, SQL Server joined with `sys.foreign_keys`), and
//! PostgreSQL's `information_schema`. Everything runs through the uniform
//! `DataSource` contract, so the results arrive as stringified rows.

use tracing::warn;

use crate::catalog::{ColumnSchema, ForeignKeyInfo, TableSchema};
use crate::config::DatabaseDescriptor;
use crate::engine::dialect::SqlDialect;
use crate::engine::drivers::{DataSource, RowSet};
use crate::engine::error::EngineResult;

const SAMPLE_ROWS: u32 = 3;

/// Enumerate every base table with columns, keys, row count, and samples.
pub async fn tables(
    source: &dyn DataSource,
    descriptor: &DatabaseDescriptor,
) -> EngineResult<Vec<TableSchema>> {
    let mut tables = match descriptor.dialect {
        SqlDialect::Sqlite => sqlite_tables(source).await?,
        SqlDialect::MySql => mysql_tables(source).await?,
        SqlDialect::Postgres => postgres_tables(source).await?,
        SqlDialect::SqlServer => sqlserver_tables(source).await?,
    };

    for table in &mut tables {
        mark_key_columns(table);
        populate_stats(source, descriptor.dialect, table).await;
    }
    Ok(tables)
}

/// Reconcile column flags with the key lists.
fn mark_key_columns(table: &mut TableSchema) {
    for column in &mut table.columns {
        if table
            .primary_keys
            .iter()
            .any(|k| k.eq_ignore_ascii_case(&column.name))
        {
            column.is_primary_key = true;
        }
        if table
            .foreign_keys
            .iter()
            .any(|fk| fk.local_column.eq_ignore_ascii_case(&column.name))
        {
            column.is_foreign_key = true;
        }
    }
}

/// COUNT(*) plus a three-row sample; failures degrade to zero/empty.
async fn populate_stats(source: &dyn DataSource, dialect: SqlDialect, table: &mut TableSchema) {
    let quoted = quote_qualified(dialect, &table.qualified_name);

    match source.execute(&format!("SELECT COUNT(*) FROM {}", quoted)).await {
        Ok(rows) => {
            table.approx_row_count = rows
                .rows
                .first()
                .and_then(|r| r.first().cloned().flatten())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
        Err(err) => warn!(table = %table.qualified_name, "row count failed: {}", err),
    }

    let sample_sql = dialect.limit_clause(SAMPLE_ROWS, &format!("SELECT * FROM {}", quoted));
    match source.execute(&sample_sql).await {
        Ok(rows) => table.sample_rows = rows.rows,
        Err(err) => warn!(table = %table.qualified_name, "sampling failed: {}", err),
    }
}

fn quote_qualified(dialect: SqlDialect, qualified: &str) -> String {
    qualified
        .split('.')
        .map(|part| dialect.quote(part))
        .collect::<Vec<_>>()
        .join(".")
}

/// Escape a value for embedding as a SQL string literal.
fn lit(value: &str) -> String {
    value.replace('\'', "''")
}

fn cell(row: &[Option<String>], idx: usize) -> String {
    row.get(idx).cloned().flatten().unwrap_or_default()
}

fn opt_cell(row: &[Option<String>], idx: usize) -> Option<String> {
    row.get(idx).cloned().flatten()
}

// ==================== SQLite ====================

async fn sqlite_tables(source: &dyn DataSource) -> EngineResult<Vec<TableSchema>> {
    let names = source
        .execute(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .await?;

    let mut tables = Vec::new();
    for row in &names.rows {
        let name = cell(row, 0);
        if name.is_empty() {
            continue;
        }

        let quoted = format!("\"{}\"", name.replace('"', "\"\""));
        let info = source
            .execute(&format!("PRAGMA table_info({})", quoted))
            .await?;

        let mut columns = Vec::new();
        let mut primary_keys = Vec::new();
        // PRAGMA table_info: cid, name, type, notnull, dflt_value, pk
        for col in &info.rows {
            let col_name = cell(col, 1);
            let pk_rank: u32 = cell(col, 5).parse().unwrap_or(0);
            if pk_rank > 0 {
                primary_keys.push(col_name.clone());
            }
            columns.push(ColumnSchema {
                name: col_name,
                data_type: cell(col, 2),
                nullable: cell(col, 3) == "0",
                max_length: None,
                is_primary_key: pk_rank > 0,
                is_foreign_key: false,
            });
        }

        let fk_rows = source
            .execute(&format!("PRAGMA foreign_key_list({})", quoted))
            .await
            .unwrap_or_else(|_| RowSet::default());

        // PRAGMA foreign_key_list: id, seq, table, from, to, …
        let foreign_keys = fk_rows
            .rows
            .iter()
            .map(|fk| {
                let local = cell(fk, 3);
                ForeignKeyInfo {
                    name: format!("fk_{}_{}", name, cell(fk, 0)),
                    referenced_table: cell(fk, 2),
                    referenced_column: opt_cell(fk, 4).unwrap_or_else(|| local.clone()),
                    local_column: local,
                }
            })
            .collect();

        tables.push(TableSchema {
            qualified_name: name,
            columns,
            primary_keys,
            foreign_keys,
            approx_row_count: 0,
            sample_rows: Vec::new(),
        });
    }
    Ok(tables)
}

// ==================== MySQL ====================

async fn mysql_tables(source: &dyn DataSource) -> EngineResult<Vec<TableSchema>> {
    let names = source
        .execute(
            "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
             ORDER BY TABLE_NAME",
        )
        .await?;

    let mut tables = Vec::new();
    for row in &names.rows {
        let name = cell(row, 0);
        if name.is_empty() {
            continue;
        }

        let cols = source
            .execute(&format!(
                "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, \
                 CHARACTER_MAXIMUM_LENGTH, COLUMN_KEY \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = '{}' \
                 ORDER BY ORDINAL_POSITION",
                lit(&name)
            ))
            .await?;

        let mut columns = Vec::new();
        let mut primary_keys = Vec::new();
        for col in &cols.rows {
            let col_name = cell(col, 0);
            let is_pk = cell(col, 4) == "PRI";
            if is_pk {
                primary_keys.push(col_name.clone());
            }
            columns.push(ColumnSchema {
                name: col_name,
                data_type: cell(col, 1),
                nullable: cell(col, 2).eq_ignore_ascii_case("YES"),
                max_length: cell(col, 3).parse().ok(),
                is_primary_key: is_pk,
                is_foreign_key: false,
            });
        }

        let fks = source
            .execute(&format!(
                "SELECT CONSTRAINT_NAME, COLUMN_NAME, REFERENCED_TABLE_NAME, \
                 REFERENCED_COLUMN_NAME \
                 FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = '{}' \
                 AND REFERENCED_TABLE_NAME IS NOT NULL",
                lit(&name)
            ))
            .await
            .unwrap_or_else(|_| RowSet::default());

        let foreign_keys = fks
            .rows
            .iter()
            .map(|fk| ForeignKeyInfo {
                name: cell(fk, 0),
                local_column: cell(fk, 1),
                referenced_table: cell(fk, 2),
                referenced_column: cell(fk, 3),
            })
            .collect();

        tables.push(TableSchema {
            qualified_name: name,
            columns,
            primary_keys,
            foreign_keys,
            approx_row_count: 0,
            sample_rows: Vec::new(),
        });
    }
    Ok(tables)
}

// ==================== PostgreSQL ====================

async fn postgres_tables(source: &dyn DataSource) -> EngineResult<Vec<TableSchema>> {
    let names = source
        .execute(
            "SELECT table_schema, table_name FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' \
             AND table_schema NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY table_schema, table_name",
        )
        .await?;

    let mut tables = Vec::new();
    for row in &names.rows {
        let schema = cell(row, 0);
        let name = cell(row, 1);
        if name.is_empty() {
            continue;
        }

        let cols = source
            .execute(&format!(
                "SELECT column_name, data_type, is_nullable, character_maximum_length \
                 FROM information_schema.columns \
                 WHERE table_schema = '{}' AND table_name = '{}' \
                 ORDER BY ordinal_position",
                lit(&schema),
                lit(&name)
            ))
            .await?;

        let columns: Vec<ColumnSchema> = cols
            .rows
            .iter()
            .map(|col| ColumnSchema {
                name: cell(col, 0),
                data_type: cell(col, 1),
                nullable: cell(col, 2).eq_ignore_ascii_case("YES"),
                max_length: cell(col, 3).parse().ok(),
                is_primary_key: false,
                is_foreign_key: false,
            })
            .collect();

        let pks = source
            .execute(&format!(
                "SELECT kcu.column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON kcu.constraint_name = tc.constraint_name \
                  AND kcu.table_schema = tc.table_schema \
                 WHERE tc.constraint_type = 'PRIMARY KEY' \
                 AND tc.table_schema = '{}' AND tc.table_name = '{}' \
                 ORDER BY kcu.ordinal_position",
                lit(&schema),
                lit(&name)
            ))
            .await
            .unwrap_or_else(|_| RowSet::default());

        let primary_keys = pks.rows.iter().map(|r| cell(r, 0)).collect();

        let fks = source
            .execute(&format!(
                "SELECT tc.constraint_name, kcu.column_name, \
                 ccu.table_schema, ccu.table_name, ccu.column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON kcu.constraint_name = tc.constraint_name \
                 JOIN information_schema.constraint_column_usage ccu \
                   ON ccu.constraint_name = tc.constraint_name \
                 WHERE tc.constraint_type = 'FOREIGN KEY' \
                 AND tc.table_schema = '{}' AND tc.table_name = '{}'",
                lit(&schema),
                lit(&name)
            ))
            .await
            .unwrap_or_else(|_| RowSet::default());

        let foreign_keys = fks
            .rows
            .iter()
            .map(|fk| ForeignKeyInfo {
                name: cell(fk, 0),
                local_column: cell(fk, 1),
                referenced_table: format!("{}.{}", cell(fk, 2), cell(fk, 3)),
                referenced_column: cell(fk, 4),
            })
            .collect();

        tables.push(TableSchema {
            qualified_name: format!("{}.{}", schema, name),
            columns,
            primary_keys,
            foreign_keys,
            approx_row_count: 0,
            sample_rows: Vec::new(),
        });
    }
    Ok(tables)
}

// ==================== SQL Server ====================

async fn sqlserver_tables(source: &dyn DataSource) -> EngineResult<Vec<TableSchema>> {
    let names = source
        .execute(
            "SELECT TABLE_SCHEMA, TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_SCHEMA, TABLE_NAME",
        )
        .await?;

    let mut tables = Vec::new();
    for row in &names.rows {
        let schema = cell(row, 0);
        let name = cell(row, 1);
        if name.is_empty() {
            continue;
        }

        let cols = source
            .execute(&format!(
                "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, CHARACTER_MAXIMUM_LENGTH \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}' \
                 ORDER BY ORDINAL_POSITION",
                lit(&schema),
                lit(&name)
            ))
            .await?;

        let columns: Vec<ColumnSchema> = cols
            .rows
            .iter()
            .map(|col| ColumnSchema {
                name: cell(col, 0),
                data_type: cell(col, 1),
                nullable: cell(col, 2).eq_ignore_ascii_case("YES"),
                max_length: cell(col, 3).parse().ok(),
                is_primary_key: false,
                is_foreign_key: false,
            })
            .collect();

        let pks = source
            .execute(&format!(
                "SELECT kcu.COLUMN_NAME \
                 FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
                 JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
                   ON kcu.CONSTRAINT_NAME = tc.CONSTRAINT_NAME \
                 WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
                 AND tc.TABLE_SCHEMA = '{}' AND tc.TABLE_NAME = '{}' \
                 ORDER BY kcu.ORDINAL_POSITION",
                lit(&schema),
                lit(&name)
            ))
            .await
            .unwrap_or_else(|_| RowSet::default());

        let primary_keys = pks.rows.iter().map(|r| cell(r, 0)).collect();

        let fks = source
            .execute(&format!(
                "SELECT fk.name, pc.name, rs.name, rt.name, rc.name \
                 FROM sys.foreign_keys fk \
                 JOIN sys.foreign_key_columns fkc \
                   ON fkc.constraint_object_id = fk.object_id \
                 JOIN sys.tables pt ON pt.object_id = fkc.parent_object_id \
                 JOIN sys.schemas ps ON ps.schema_id = pt.schema_id \
                 JOIN sys.columns pc ON pc.object_id = fkc.parent_object_id \
                  AND pc.column_id = fkc.parent_column_id \
                 JOIN sys.tables rt ON rt.object_id = fkc.referenced_object_id \
                 JOIN sys.schemas rs ON rs.schema_id = rt.schema_id \
                 JOIN sys.columns rc ON rc.object_id = fkc.referenced_object_id \
                  AND rc.column_id = fkc.referenced_column_id \
                 WHERE ps.name = '{}' AND pt.name = '{}'",
                lit(&schema),
                lit(&name)
            ))
            .await
            .unwrap_or_else(|_| RowSet::default());

        let foreign_keys = fks
            .rows
            .iter()
            .map(|fk| ForeignKeyInfo {
                name: cell(fk, 0),
                local_column: cell(fk, 1),
                referenced_table: format!("{}.{}", cell(fk, 2), cell(fk, 3)),
                referenced_column: cell(fk, 4),
            })
            .collect();

        tables.push(TableSchema {
            qualified_name: format!("{}.{}", schema, name),
            columns,
            primary_keys,
            foreign_keys,
            approx_row_count: 0,
            sample_rows: Vec::new(),
        });
    }
    Ok(tables)
}
