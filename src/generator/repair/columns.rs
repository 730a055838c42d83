// SPDX-License-Identifier: Apache-2.0

//! Column-level repairs: alias rebinding, invalid column replacement,
//! SELECT-list reconstruction, ambiguity qualification, and the dialect
//! post-passes.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use super::context::{
    contains_identifier, select_list_span, split_top_level, unquote, AliasMap, RepairContext,
    SQL_FUNCTIONS,
};
use crate::engine::dialect::SqlDialect;

/// MySQL words that need backtick quoting when used as table names.
const MYSQL_RESERVED: &[&str] = &["order", "group", "select", "where", "table", "index", "key"];

fn alias_col_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b").unwrap()
    })
}

/// True when the regex match at `range` is a standalone two-part reference
/// (not part of a longer dotted chain, not a function call).
fn standalone(sql: &str, start: usize, end: usize) -> bool {
    let bytes = sql.as_bytes();
    if start > 0 && (bytes[start - 1] == b'.' || bytes[start - 1] == b'"' || bytes[start - 1] == b']' || bytes[start - 1] == b'`') {
        return false;
    }
    if end < bytes.len() && (bytes[end] == b'.' || bytes[end] == b'(') {
        return false;
    }
    true
}

/// Resolve the snapshot table behind an alias-map entry.
fn table_of<'a>(ctx: &RepairContext<'a>, table_ref: &str) -> Option<&'a crate::catalog::TableSchema> {
    let bare = unquote(table_ref.rsplit('.').next().unwrap_or(table_ref));
    ctx.snapshot
        .table(unquote(table_ref))
        .or_else(|| ctx.snapshot.table(bare))
}

/// Stage 6: `alias.column` where the alias's table lacks the column, but
/// exactly one other table in the query owns it: rebind the alias.
pub fn repair_undefined_alias_refs(ctx: &RepairContext, sql: &str) -> String {
    let alias_map = AliasMap::parse(sql);
    let result = alias_col_re().replace_all(sql, |caps: &Captures| {
        let whole = caps.get(0).unwrap();
        if !standalone(sql, whole.start(), whole.end()) {
            return caps[0].to_string();
        }
        let (alias, column) = (&caps[1], &caps[2]);
        let Some(bound) = alias_map.resolve(alias) else {
            return caps[0].to_string();
        };
        let Some(table) = table_of(ctx, bound) else {
            return caps[0].to_string();
        };
        if table.has_column(column) {
            return caps[0].to_string();
        }

        // Owners of the column among tables actually in the query.
        let owners: Vec<&str> = alias_map
            .iter()
            .filter(|(a, t)| *a != alias.to_lowercase() && {
                table_of(ctx, t).is_some_and(|schema| schema.has_column(column))
            })
            .map(|(a, _)| a)
            .collect();

        if owners.len() == 1 {
            format!("{}.{}", owners[0], column)
        } else {
            caps[0].to_string()
        }
    });
    result.into_owned()
}

/// Stage 7: a repair pass can leave `SELECT FROM …`. Refill with the first
/// required mapping column, else the driving table's primary key, else its
/// first column.
pub fn fix_empty_select(ctx: &RepairContext, sql: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)\bSELECT\s+(DISTINCT\s+)?FROM\b").unwrap());
    if !re.is_match(sql) {
        return sql.to_string();
    }

    let alias_map = AliasMap::parse(sql);
    let column = pick_fill_column(ctx, &alias_map);
    re.replace(sql, format!("SELECT ${{1}}{} FROM", column).as_str())
        .into_owned()
}

fn pick_fill_column(ctx: &RepairContext, alias_map: &AliasMap) -> String {
    for required in &ctx.required_columns {
        if let Some(alias) = alias_map.alias_for_table(&required.table) {
            return format!("{}.{}", alias, required.column);
        }
    }
    if let Some((alias, table_ref)) = alias_map.driving() {
        if let Some(table) = table_of(ctx, table_ref) {
            let column = table
                .primary_keys
                .first()
                .cloned()
                .or_else(|| table.columns.first().map(|c| c.name.clone()));
            if let Some(column) = column {
                return format!("{}.{}", alias, column);
            }
        }
    }
    "1".to_string()
}

/// Stage 10: a known column used as a function call and aliased `…Count…`
/// is what the model does instead of `COUNT(col)`.
pub fn repair_column_used_as_function(ctx: &RepairContext, sql: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_]*)\s*\(\s*([^()]*?)\s*\)\s+AS\s+([A-Za-z_][A-Za-z0-9_]*)")
            .unwrap()
    });

    let alias_map = AliasMap::parse(sql);
    let result = re.replace_all(sql, |caps: &Captures| {
        let (head, alias) = (&caps[1], &caps[3]);
        if !alias.to_lowercase().contains("count") {
            return caps[0].to_string();
        }
        if SQL_FUNCTIONS.iter().any(|f| head.eq_ignore_ascii_case(f)) {
            return caps[0].to_string();
        }
        let head_is_column = alias_map
            .iter()
            .filter_map(|(_, t)| table_of(ctx, t))
            .any(|table| table.has_column(head));
        if head_is_column {
            format!("COUNT({}) AS {}", head, alias)
        } else {
            caps[0].to_string()
        }
    });
    result.into_owned()
}

/// Stage 11: `alias.column` into a valid table but a nonexistent column is
/// replaced by the longest-suffix-matching column of that table, falling
/// back to its primary key.
pub fn replace_invalid_columns(ctx: &RepairContext, sql: &str) -> String {
    let alias_map = AliasMap::parse(sql);
    let result = alias_col_re().replace_all(sql, |caps: &Captures| {
        let whole = caps.get(0).unwrap();
        if !standalone(sql, whole.start(), whole.end()) {
            return caps[0].to_string();
        }
        let (alias, column) = (&caps[1], &caps[2]);
        let Some(bound) = alias_map.resolve(alias) else {
            return caps[0].to_string();
        };
        let Some(table) = table_of(ctx, bound) else {
            return caps[0].to_string();
        };
        if table.has_column(column) {
            return caps[0].to_string();
        }

        if let Some(replacement) = ctx.closest_column(table, column) {
            return format!("{}.{}", alias, replacement);
        }
        if let Some(pk) = table.primary_keys.first() {
            return format!("{}.{}", alias, pk);
        }
        caps[0].to_string()
    });
    result.into_owned()
}

/// Is this SELECT-list / GROUP BY term a simple reference the snapshot can
/// veto? Returns `Some(false)` when it is simple and invalid. References
/// through `opaque` names (CTEs, derived tables) are never vetoed.
fn simple_ref_valid(
    ctx: &RepairContext,
    alias_map: &AliasMap,
    opaque: &[String],
    term: &str,
) -> Option<bool> {
    static SIMPLE: OnceLock<Regex> = OnceLock::new();
    let re = SIMPLE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:([A-Za-z_][A-Za-z0-9_]*)\.)?([A-Za-z_][A-Za-z0-9_]*)\s*(?:AS\s+[A-Za-z_][A-Za-z0-9_]*\s*)?$")
            .unwrap()
    });
    let caps = re.captures(term)?;
    let column = caps.get(2)?.as_str();
    if column == "*" {
        return Some(true);
    }

    match caps.get(1) {
        Some(alias) => {
            if opaque.contains(&alias.as_str().to_lowercase()) {
                return Some(true);
            }
            let Some(bound) = alias_map.resolve(alias.as_str()) else {
                return Some(false);
            };
            let Some(table) = table_of(ctx, bound) else {
                return Some(false);
            };
            Some(table.has_column(column))
        }
        None => {
            // Bare column: a statement that defines its own relations can
            // project anything; otherwise some query table must own it.
            if !opaque.is_empty() {
                return Some(true);
            }
            let owned = alias_map
                .iter()
                .filter_map(|(_, t)| table_of(ctx, t))
                .any(|table| table.has_column(column));
            Some(owned)
        }
    }
}

/// Stage 14: drop invalid simple references from SELECT and GROUP BY, then
/// sweep up the syntactic debris earlier stages may have left.
pub fn remove_invalid_columns(ctx: &RepairContext, sql: &str) -> String {
    let alias_map = AliasMap::parse(sql);
    let opaque = super::context::opaque_aliases(sql);
    let mut out = sql.to_string();

    if let Some((start, end)) = select_list_span(&out) {
        let items = split_top_level(&out[start..end], ',');
        let kept: Vec<String> = items
            .iter()
            .filter(|item| {
                !item.trim().is_empty()
                    && simple_ref_valid(ctx, &alias_map, &opaque, item).unwrap_or(true)
            })
            .map(|item| item.trim().to_string())
            .collect();
        if !kept.is_empty() {
            out.replace_range(start..end, &(kept.join(", ") + " "));
        }
    }

    if let Some((start, end)) = super::context::clause_span(&out, "GROUP BY") {
        let terms = split_top_level(&out[start..end], ',');
        let kept: Vec<String> = terms
            .iter()
            .filter(|term| {
                !term.trim().is_empty()
                    && simple_ref_valid(ctx, &alias_map, &opaque, term).unwrap_or(true)
            })
            .map(|term| term.trim().to_string())
            .collect();
        if kept.is_empty() {
            let mut upper = out[..start].to_string();
            upper.make_ascii_uppercase();
            let head = upper.rfind("GROUP BY").unwrap_or(start);
            out.replace_range(head..end, "");
        } else {
            out.replace_range(start..end, &format!(" {} ", kept.join(", ")));
        }
    }

    cleanup_debris(&out)
}

/// Syntactic debris sweep shared by the removal stages.
pub fn cleanup_debris(sql: &str) -> String {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let rules = RULES.get_or_init(|| {
        vec![
            (Regex::new(r",\s*,").unwrap(), ","),
            (Regex::new(r"(?i)SELECT\s*,").unwrap(), "SELECT "),
            (Regex::new(r"(?i),\s*FROM\b").unwrap(), " FROM"),
            (Regex::new(r"(?i)\bWHERE\s+(AND|OR)\b").unwrap(), "WHERE"),
            (Regex::new(r"(?i)\bWHERE\s+IS\s+(NOT\s+)?NULL").unwrap(), ""),
            (Regex::new(r"(?i)\b(AND|OR)\s+(AND|OR)\b").unwrap(), "$2"),
            (Regex::new(r"(?i)\bON\s+(AND|OR)\b").unwrap(), "ON"),
            (Regex::new(r"(?i)\bWHERE\s*(GROUP BY|ORDER BY|HAVING|LIMIT|$)").unwrap(), "$1"),
            (Regex::new(r"(?i)\bGROUP BY\s*(ORDER BY|HAVING|LIMIT|$)").unwrap(), "$1"),
            (Regex::new(r"(?i)\bORDER BY\s*(LIMIT|$)").unwrap(), "$1"),
            (Regex::new(r"(?i)\b(DESC|ASC)\s+(DESC|ASC)\b").unwrap(), "$1"),
            (Regex::new(r",\s*$").unwrap(), ""),
            (Regex::new(r"  +").unwrap(), " "),
        ]
    });

    let mut out = sql.to_string();
    for _ in 0..4 {
        let mut changed = false;
        for (re, replacement) in rules {
            let next = re.replace_all(&out, *replacement).into_owned();
            if next != out {
                out = next;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    out.trim().to_string()
}

/// Stage 19: bare columns owned by several joined tables get qualified with
/// the driving table's alias when it owns the column, else the first
/// declared owner.
pub fn disambiguate_columns(ctx: &RepairContext, sql: &str) -> String {
    let alias_map = AliasMap::parse(sql);
    // A statement defining its own relations knows better than we do.
    if alias_map.iter().count() < 2 || !super::context::opaque_aliases(sql).is_empty() {
        return sql.to_string();
    }

    let Some((start, end)) = select_list_span(sql) else {
        return sql.to_string();
    };
    let items = split_top_level(&sql[start..end], ',');

    let mut rebuilt: Vec<String> = Vec::new();
    for item in &items {
        let trimmed = item.trim();
        let bare_is_column = trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !trimmed.is_empty();
        if !bare_is_column {
            rebuilt.push(trimmed.to_string());
            continue;
        }

        let owners: Vec<&str> = alias_map
            .iter()
            .filter(|(_, t)| table_of(ctx, t).is_some_and(|schema| schema.has_column(trimmed)))
            .map(|(a, _)| a)
            .collect();
        if owners.len() < 2 {
            rebuilt.push(trimmed.to_string());
            continue;
        }

        let preferred = alias_map
            .driving()
            .filter(|(_, t)| table_of(ctx, t).is_some_and(|schema| schema.has_column(trimmed)))
            .map(|(a, _)| a)
            .unwrap_or(owners[0]);
        rebuilt.push(format!("{}.{}", preferred, trimmed));
    }

    let mut out = sql.to_string();
    out.replace_range(start..end, &(rebuilt.join(", ") + " "));
    out
}

/// Stage 20: dialect-specific post-passes. MySQL re-quotes reserved table
/// names with backticks; SQL Server rebinds aliases that never got defined.
pub fn dialect_post_pass(ctx: &RepairContext, sql: &str) -> String {
    match ctx.dialect {
        SqlDialect::MySql => mysql_requote(ctx, sql),
        SqlDialect::SqlServer => rebind_unbound_aliases(ctx, sql),
        _ => sql.to_string(),
    }
}

fn mysql_requote(ctx: &RepairContext, sql: &str) -> String {
    let mut out = sql.to_string();
    for table in &ctx.snapshot.tables {
        let short = table.short_name();
        if !MYSQL_RESERVED.iter().any(|w| short.eq_ignore_ascii_case(w)) {
            continue;
        }
        let quoted = format!("`{}`", short);
        if contains_identifier(&out, short) && !out.contains(&quoted) {
            let re = Regex::new(&format!(
                r"(?i)\b(FROM|JOIN)\s+{}\b",
                regex::escape(short)
            ))
            .expect("static pattern");
            out = re.replace_all(&out, format!("$1 {}", quoted).as_str()).into_owned();
        }
    }
    out
}

fn rebind_unbound_aliases(ctx: &RepairContext, sql: &str) -> String {
    let alias_map = AliasMap::parse(sql);
    let opaque = super::context::opaque_aliases(sql);
    let result = alias_col_re().replace_all(sql, |caps: &Captures| {
        let whole = caps.get(0).unwrap();
        if !standalone(sql, whole.start(), whole.end()) {
            return caps[0].to_string();
        }
        let (alias, column) = (&caps[1], &caps[2]);
        if alias_map.contains(alias)
            || opaque.contains(&alias.to_lowercase())
            || ctx.snapshot.has_table(alias)
            || ctx.snapshot.tables.iter().any(|t| {
                t.qualified_name.contains('.')
                    && t.qualified_name
                        .split('.')
                        .next()
                        .is_some_and(|s| s.eq_ignore_ascii_case(alias))
            })
        {
            return caps[0].to_string();
        }

        let owners: Vec<&str> = alias_map
            .iter()
            .filter(|(_, t)| table_of(ctx, t).is_some_and(|schema| schema.has_column(column)))
            .map(|(a, _)| a)
            .collect();
        if owners.len() == 1 {
            format!("{}.{}", owners[0], column)
        } else {
            caps[0].to_string()
        }
    });
    result.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::repair::context::MappingColumn;
    use crate::generator::repair::testutil::{ctx, ctx_with_mappings, shop_snapshot};

    #[test]
    fn alias_rebinds_to_unique_owner() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        // orders has no `name`; people do. Mirrors a model mixing aliases up.
        let sql = "SELECT o.name FROM orders o JOIN customers p ON o.customer_id = p.id";
        let out = repair_undefined_alias_refs(&ctx, sql);
        assert_eq!(
            out,
            "SELECT p.name FROM orders o JOIN customers p ON o.customer_id = p.id"
        );
        // Idempotent.
        assert_eq!(repair_undefined_alias_refs(&ctx, &out), out);
    }

    #[test]
    fn empty_select_is_refilled_with_pk() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT FROM orders o WHERE o.total > 5";
        assert_eq!(
            fix_empty_select(&ctx, sql),
            "SELECT o.id FROM orders o WHERE o.total > 5"
        );
    }

    #[test]
    fn empty_select_prefers_mapping_column() {
        let snapshot = shop_snapshot();
        let ctx = ctx_with_mappings(
            &snapshot,
            vec![MappingColumn {
                table: "orders".to_string(),
                column: "customer_id".to_string(),
            }],
            vec![],
        );
        let sql = "SELECT FROM orders o";
        assert_eq!(fix_empty_select(&ctx, sql), "SELECT o.customer_id FROM orders o");
    }

    #[test]
    fn column_called_as_function_becomes_count() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT total(o.id) AS TotalCount FROM orders o";
        assert_eq!(
            repair_column_used_as_function(&ctx, sql),
            "SELECT COUNT(total) AS TotalCount FROM orders o"
        );
        // Genuine functions are untouched.
        let sql = "SELECT COUNT(o.id) AS OrderCount FROM orders o";
        assert_eq!(repair_column_used_as_function(&ctx, sql), sql);
    }

    #[test]
    fn invalid_column_replaced_by_suffix_match() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT o.order_total FROM orders o";
        assert_eq!(
            replace_invalid_columns(&ctx, sql),
            "SELECT o.total FROM orders o"
        );
    }

    #[test]
    fn invalid_column_falls_back_to_primary_key() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT o.zzz FROM orders o";
        assert_eq!(replace_invalid_columns(&ctx, sql), "SELECT o.id FROM orders o");
    }

    #[test]
    fn invalid_select_items_are_dropped_with_cleanup() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT o.id, ghost.widget, o.total FROM orders o";
        let out = remove_invalid_columns(&ctx, sql);
        assert_eq!(out, "SELECT o.id, o.total FROM orders o");
    }

    #[test]
    fn cleanup_sweeps_comma_and_keyword_debris() {
        assert_eq!(
            cleanup_debris("SELECT a, FROM t WHERE AND x = 1 ORDER BY a DESC DESC"),
            "SELECT a FROM t WHERE x = 1 ORDER BY a DESC"
        );
        assert_eq!(cleanup_debris("SELECT a FROM t WHERE GROUP BY a"), "SELECT a FROM t GROUP BY a");
    }

    #[test]
    fn ambiguous_bare_column_is_qualified() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        // Both orders and customers own `id`; orders drives the query.
        let sql = "SELECT id FROM orders o JOIN customers c ON o.customer_id = c.id";
        let out = disambiguate_columns(&ctx, sql);
        assert_eq!(
            out,
            "SELECT o.id FROM orders o JOIN customers c ON o.customer_id = c.id"
        );
    }

    #[test]
    fn sqlserver_post_pass_rebinds_unknown_alias() {
        let snapshot = crate::generator::repair::testutil::mssql_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT x.Total FROM dbo.Orders o";
        let out = dialect_post_pass(&ctx, sql);
        assert_eq!(out, "SELECT o.Total FROM dbo.Orders o");
    }
}
