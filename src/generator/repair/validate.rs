// SPDX-License-Identifier: Apache-2.0

//! Final validation after the cascade. A statement that fails here never
//! reaches the executor; its sub-plan is marked failed instead.

use std::sync::OnceLock;

use regex::Regex;

use super::context::{contains_identifier, unquote, AliasMap, RepairContext, SEG};
use crate::engine::dialect::strip_comments;
use crate::engine::error::{EngineError, EngineResult};

/// Fragments the model sometimes leaves instead of SQL.
const PLACEHOLDERS: &[&str] = &[
    "ABOVE QUERY",
    "YOUR QUERY",
    "SUBQUERY HERE",
    "PLACEHOLDER",
    "INSERT QUERY",
];

pub fn validate(ctx: &RepairContext, sql: &str) -> EngineResult<()> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(EngineError::generation("Repair produced an empty statement"));
    }
    // Structural gate: SELECT/WITH head, balanced parentheses, no
    // forbidden verbs.
    ctx.dialect.syntax_check(trimmed)?;

    // Placeholder scan runs over comment-stripped text.
    let stripped = strip_comments(trimmed);
    let mut upper = stripped.clone();
    upper.make_ascii_uppercase();
    for placeholder in PLACEHOLDERS {
        if upper.contains(placeholder) {
            return Err(EngineError::generation(format!(
                "Statement still contains placeholder text: {}",
                placeholder
            )));
        }
    }

    validate_tables(ctx, &stripped)?;
    validate_column_refs(ctx, &stripped)?;
    validate_mapping_columns(ctx, &stripped)?;
    Ok(())
}

/// Every FROM/JOIN operand must resolve in the snapshot or be a name the
/// statement itself defines (CTE).
fn validate_tables(ctx: &RepairContext, sql: &str) -> EngineResult<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)\b(?:FROM|JOIN)\s+({seg}(?:\.{seg}){{0,2}})",
            seg = SEG
        ))
        .unwrap()
    });

    let opaque = super::context::opaque_aliases(sql);
    for caps in re.captures_iter(sql) {
        let table_ref = &caps[1];
        if table_ref.starts_with('(') {
            continue;
        }
        let full: String = table_ref
            .split('.')
            .map(unquote)
            .collect::<Vec<_>>()
            .join(".");
        let short = full.rsplit('.').next().unwrap_or(&full);
        if !ctx.snapshot.has_table(&full)
            && !ctx.snapshot.has_table(short)
            && !opaque.contains(&short.to_lowercase())
        {
            return Err(EngineError::generation(format!(
                "Unknown table in final statement: {}",
                table_ref
            )));
        }
    }
    Ok(())
}

/// Every `head.column` reference must resolve through an alias, a table, or
/// a schema name.
fn validate_column_refs(ctx: &RepairContext, sql: &str) -> EngineResult<()> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*|\*)").unwrap()
    });

    let alias_map = AliasMap::parse(sql);
    let opaque = super::context::opaque_aliases(sql);
    for caps in re.captures_iter(sql) {
        let whole = caps.get(0).unwrap();
        let bytes = sql.as_bytes();
        if whole.start() > 0 && bytes[whole.start() - 1] == b'.' {
            continue;
        }
        if whole.end() < bytes.len() && bytes[whole.end()] == b'.' {
            continue;
        }
        let (head, column) = (&caps[1], &caps[2]);
        if column == "*" {
            continue;
        }
        // References through CTEs and derived tables are opaque.
        if opaque.contains(&head.to_lowercase()) {
            continue;
        }

        if let Some(bound) = alias_map.resolve(head) {
            let bare = unquote(bound.rsplit('.').next().unwrap_or(bound));
            let table = ctx
                .snapshot
                .table(unquote(bound))
                .or_else(|| ctx.snapshot.table(bare));
            if let Some(table) = table {
                if !table.has_column(column) {
                    return Err(EngineError::generation(format!(
                        "Unknown column in final statement: {}.{}",
                        head, column
                    )));
                }
                continue;
            }
        }
        if ctx.snapshot.table(head).is_some_and(|t| t.has_column(column)) {
            continue;
        }
        // Schema prefix of a qualified table (`dbo.Orders`): the table pass
        // already vetted it.
        let is_schema = ctx.snapshot.tables.iter().any(|t| {
            t.qualified_name.contains('.')
                && t.qualified_name
                    .split('.')
                    .next()
                    .is_some_and(|s| s.eq_ignore_ascii_case(head))
        });
        if is_schema {
            continue;
        }
        return Err(EngineError::generation(format!(
            "Unresolved reference in final statement: {}.{}",
            head, column
        )));
    }
    Ok(())
}

/// Required mapping columns must appear by name.
fn validate_mapping_columns(ctx: &RepairContext, sql: &str) -> EngineResult<()> {
    for required in &ctx.required_columns {
        if !contains_identifier(sql, &required.column) {
            return Err(EngineError::generation(format!(
                "Required mapping column missing from statement: {}.{}",
                required.table, required.column
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::repair::context::MappingColumn;
    use crate::generator::repair::testutil::{ctx, ctx_with_mappings, shop_snapshot};

    #[test]
    fn accepts_clean_statement() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        assert!(validate(
            &ctx,
            "SELECT o.id, o.total FROM orders o JOIN customers c ON o.customer_id = c.id"
        )
        .is_ok());
    }

    #[test]
    fn rejects_placeholder_text() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let err = validate(&ctx, "SELECT id FROM orders WHERE id IN (SUBQUERY HERE)").unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }

    #[test]
    fn rejects_unknown_table() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        assert!(validate(&ctx, "SELECT id FROM phantoms").is_err());
    }

    #[test]
    fn rejects_unknown_column_ref() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        assert!(validate(&ctx, "SELECT o.widget FROM orders o").is_err());
    }

    #[test]
    fn rejects_missing_mapping_column() {
        let snapshot = shop_snapshot();
        let ctx = ctx_with_mappings(
            &snapshot,
            vec![MappingColumn {
                table: "orders".to_string(),
                column: "customer_id".to_string(),
            }],
            vec![],
        );
        assert!(validate(&ctx, "SELECT o.total FROM orders o").is_err());
        assert!(validate(&ctx, "SELECT o.customer_id, o.total FROM orders o").is_ok());
    }
}
