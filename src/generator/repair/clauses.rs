// SPDX-License-Identifier: Apache-2.0

//! Clause-level repairs: GROUP BY closure and ORDER BY term validation.

use super::context::{
    clause_span, is_aggregate_expr, select_list_span, split_top_level, unquote, AliasMap,
    RepairContext,
};
use super::mappings::group_by_insertion_point;

/// Strip a trailing `AS alias` from a SELECT-list item, leaving the
/// expression.
fn expression_of(item: &str) -> &str {
    let mut upper = item.to_string();
    upper.make_ascii_uppercase();
    if let Some(pos) = upper.rfind(" AS ") {
        item[..pos].trim()
    } else {
        item.trim()
    }
}

/// The alias a SELECT-list item is exported under, if any.
fn alias_of(item: &str) -> Option<&str> {
    let mut upper = item.to_string();
    upper.make_ascii_uppercase();
    upper.rfind(" AS ").map(|pos| item[pos + 4..].trim())
}

/// Stage 13: when aggregates and plain expressions share a SELECT list,
/// every non-aggregate expression must be in GROUP BY.
pub fn group_by_closure(_ctx: &RepairContext, sql: &str) -> String {
    let Some((start, end)) = select_list_span(sql) else {
        return sql.to_string();
    };
    let items = split_top_level(&sql[start..end], ',');

    let has_aggregate = items.iter().any(|i| is_aggregate_expr(i));
    let plain: Vec<&str> = items
        .iter()
        .map(|i| expression_of(i))
        .filter(|e| !e.is_empty() && *e != "*" && !is_aggregate_expr(e))
        .collect();

    if !has_aggregate || plain.is_empty() {
        return sql.to_string();
    }

    let mut out = sql.to_string();
    match clause_span(&out, "GROUP BY") {
        Some((g_start, g_end)) => {
            let existing = out[g_start..g_end].to_string();
            let mut terms: Vec<String> = split_top_level(&existing, ',')
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            let mut changed = false;
            for expr in &plain {
                if !terms.iter().any(|t| t.eq_ignore_ascii_case(expr)) {
                    terms.push(expr.to_string());
                    changed = true;
                }
            }
            if changed {
                out.replace_range(g_start..g_end, &format!(" {} ", terms.join(", ")));
            }
        }
        None => {
            let clause = format!(
                " GROUP BY {}",
                plain
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let point = group_by_insertion_point(&out);
            out.insert_str(point, &clause);
        }
    }
    out
}

/// Stage 15: ORDER BY terms that are neither valid columns nor known
/// aliases collapse to ordinal `1`.
pub fn repair_order_by(ctx: &RepairContext, sql: &str) -> String {
    let Some((start, end)) = clause_span(sql, "ORDER BY") else {
        return sql.to_string();
    };

    let alias_map = AliasMap::parse(sql);
    let opaque = super::context::opaque_aliases(sql);
    let select_aliases: Vec<String> = select_list_span(sql)
        .map(|(s, e)| {
            split_top_level(&sql[s..e], ',')
                .iter()
                .filter_map(|item| alias_of(item))
                .map(|a| a.to_lowercase())
                .collect()
        })
        .unwrap_or_default();

    let body = &sql[start..end];
    let mut changed = false;
    let terms: Vec<String> = split_top_level(body, ',')
        .iter()
        .map(|raw| {
            let term = raw.trim();
            if term.is_empty() {
                return String::new();
            }
            let (expr, direction) = split_direction(term);
            if order_term_valid(ctx, &alias_map, &opaque, &select_aliases, expr) {
                term.to_string()
            } else {
                changed = true;
                match direction {
                    Some(dir) => format!("1 {}", dir),
                    None => "1".to_string(),
                }
            }
        })
        .filter(|t| !t.is_empty())
        .collect();

    if !changed {
        return sql.to_string();
    }
    let mut out = sql.to_string();
    out.replace_range(start..end, &format!(" {} ", terms.join(", ")));
    out.trim_end().to_string()
}

fn split_direction(term: &str) -> (&str, Option<&str>) {
    let mut upper = term.to_string();
    upper.make_ascii_uppercase();
    for dir in ["DESC", "ASC"] {
        if upper.ends_with(dir) {
            let cut = term.len() - dir.len();
            if term[..cut].ends_with(' ') {
                return (term[..cut].trim(), Some(&term[cut..]));
            }
        }
    }
    (term, None)
}

fn order_term_valid(
    ctx: &RepairContext,
    alias_map: &AliasMap,
    opaque: &[String],
    select_aliases: &[String],
    expr: &str,
) -> bool {
    let expr = expr.trim();
    if expr.chars().all(|c| c.is_ascii_digit()) && !expr.is_empty() {
        return true;
    }
    if is_aggregate_expr(expr) {
        return true;
    }
    if select_aliases.contains(&expr.to_lowercase()) {
        return true;
    }
    if let Some((head, column)) = expr.split_once('.') {
        if opaque.contains(&head.to_lowercase()) {
            return true;
        }
        let Some(bound) = alias_map.resolve(head) else {
            return false;
        };
        let bare = unquote(bound.rsplit('.').next().unwrap_or(bound));
        return ctx
            .snapshot
            .table(bare)
            .is_some_and(|t| t.has_column(unquote(column)));
    }
    // With self-defined relations in play, bare names are unverifiable.
    if !opaque.is_empty() {
        return true;
    }
    // Bare column: any table in the query owning it makes it valid.
    alias_map.iter().any(|(_, table_ref)| {
        let bare = unquote(table_ref.rsplit('.').next().unwrap_or(table_ref));
        ctx.snapshot
            .table(bare)
            .is_some_and(|t| t.has_column(unquote(expr)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::repair::testutil::{ctx, shop_snapshot};

    #[test]
    fn group_by_is_created_for_mixed_select() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT o.customer_id, COUNT(*) FROM orders o";
        assert_eq!(
            group_by_closure(&ctx, sql),
            "SELECT o.customer_id, COUNT(*) FROM orders o GROUP BY o.customer_id"
        );
    }

    #[test]
    fn group_by_gains_missing_expressions() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql =
            "SELECT o.customer_id, o.total, COUNT(*) FROM orders o GROUP BY o.customer_id";
        let out = group_by_closure(&ctx, sql);
        assert!(out.contains("GROUP BY o.customer_id, o.total"), "got: {}", out);
        assert_eq!(group_by_closure(&ctx, &out), out);
    }

    #[test]
    fn pure_aggregate_needs_no_group_by() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT COUNT(*) FROM orders";
        assert_eq!(group_by_closure(&ctx, sql), sql);
    }

    #[test]
    fn alias_of_strips_expression() {
        assert_eq!(alias_of("SUM(x) AS total"), Some("total"));
        assert_eq!(alias_of("plain"), None);
        assert_eq!(expression_of("o.total AS t"), "o.total");
    }

    #[test]
    fn invalid_order_terms_become_ordinals() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT o.total FROM orders o ORDER BY ghost_col DESC, o.total ASC";
        assert_eq!(
            repair_order_by(&ctx, sql),
            "SELECT o.total FROM orders o ORDER BY 1 DESC, o.total ASC"
        );
    }

    #[test]
    fn select_alias_in_order_by_is_valid() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT SUM(o.total) AS grand FROM orders o GROUP BY o.customer_id ORDER BY grand DESC";
        assert_eq!(repair_order_by(&ctx, sql), sql);
    }

    #[test]
    fn ordinal_order_terms_are_valid() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT o.total FROM orders o ORDER BY 1";
        assert_eq!(repair_order_by(&ctx, sql), sql);
    }
}
