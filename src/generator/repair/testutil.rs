// SPDX-License-Identifier: Apache-2.0

//! Snapshot fixtures shared by the repair-stage tests.

use chrono::Utc;

use super::context::{MappingColumn, RepairContext};
use crate::catalog::{ColumnSchema, ForeignKeyInfo, SchemaSnapshot, SnapshotStatus, TableSchema};
use crate::config::CrossMapping;
use crate::engine::dialect::SqlDialect;

pub fn column(name: &str) -> ColumnSchema {
    ColumnSchema {
        name: name.to_string(),
        data_type: "TEXT".to_string(),
        nullable: true,
        max_length: None,
        is_primary_key: false,
        is_foreign_key: false,
    }
}

pub fn table(name: &str, cols: &[&str], pk: &str, fks: &[(&str, &str, &str)]) -> TableSchema {
    TableSchema {
        qualified_name: name.to_string(),
        columns: cols.iter().map(|c| column(c)).collect(),
        primary_keys: vec![pk.to_string()],
        foreign_keys: fks
            .iter()
            .map(|(local, ref_table, ref_col)| ForeignKeyInfo {
                name: format!("fk_{}_{}", name, local),
                local_column: local.to_string(),
                referenced_table: ref_table.to_string(),
                referenced_column: ref_col.to_string(),
            })
            .collect(),
        approx_row_count: 10,
        sample_rows: vec![],
    }
}

pub fn snapshot(db_id: &str, dialect: SqlDialect, tables: Vec<TableSchema>) -> SchemaSnapshot {
    SchemaSnapshot {
        db_id: db_id.to_string(),
        display_name: db_id.to_string(),
        dialect,
        catalog_name: db_id.to_string(),
        tables,
        total_row_count: 0,
        status: SnapshotStatus::Completed,
        last_analyzed: Utc::now(),
        error: None,
    }
}

/// SQLite shop: orders → customers, plus an unrelated inventory table.
pub fn shop_snapshot() -> SchemaSnapshot {
    snapshot(
        "shop",
        SqlDialect::Sqlite,
        vec![
            table(
                "orders",
                &["id", "customer_id", "total"],
                "id",
                &[("customer_id", "customers", "id")],
            ),
            table("customers", &["id", "name"], "id", &[]),
            table("inventory", &["sku", "stock"], "sku", &[]),
        ],
    )
}

/// Postgres warehouse with a schema-qualified table.
pub fn warehouse_snapshot() -> SchemaSnapshot {
    snapshot(
        "warehouse",
        SqlDialect::Postgres,
        vec![table("sales.invoices", &["id", "amount"], "id", &[])],
    )
}

/// SQL Server CRM with dbo-qualified naming.
pub fn mssql_snapshot() -> SchemaSnapshot {
    snapshot(
        "crm_mssql",
        SqlDialect::SqlServer,
        vec![table("dbo.Orders", &["Id", "Total"], "Id", &[])],
    )
}

/// Target side of a customers→orders mapping, with descriptive columns.
pub fn orders_db_snapshot() -> SchemaSnapshot {
    snapshot(
        "orders_db",
        SqlDialect::Sqlite,
        vec![table(
            "orders",
            &["id", "customer_id", "ship_city", "status_label", "total"],
            "id",
            &[],
        )],
    )
}

pub fn ctx(snapshot: &SchemaSnapshot) -> RepairContext<'_> {
    RepairContext::new(snapshot, vec!["crm".to_string()], vec![], vec![])
}

pub fn ctx_with_mappings<'a>(
    snapshot: &'a SchemaSnapshot,
    required: Vec<MappingColumn>,
    incoming: Vec<CrossMapping>,
) -> RepairContext<'a> {
    RepairContext::new(snapshot, vec!["crm".to_string()], required, incoming)
}
