// SPDX-License-Identifier: Apache-2.0

//! Mapping-aware repairs: columns that must be projected because they feed
//! (or receive) cross-database value injection, source→target column
//! substitution, and the descriptive columns that make injected result sets
//! readable.

use std::sync::OnceLock;

use regex::Regex;

use super::context::{
    clause_span, contains_identifier, is_aggregate_expr, select_list_span, split_top_level,
    AliasMap, RepairContext,
};

/// Column names considered descriptive enough to surface next to an
/// injected mapping column.
const DESCRIPTIVE_NAMES: &[&str] = &[
    "Name", "Title", "Description", "City", "Address", "Location", "Text", "Label",
    "FirstName", "LastName",
];

const MAX_DESCRIPTIVE: usize = 3;

/// Replace whole-word occurrences of an identifier.
fn replace_identifier(sql: &str, from: &str, to: &str) -> String {
    let re = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(from))).expect("escaped pattern");
    re.replace_all(sql, to).into_owned()
}

/// Stage 8: the target-side query still speaks in the source database's
/// column name. When the target table owns only the target column, swap the
/// names.
pub fn substitute_source_column(ctx: &RepairContext, sql: &str) -> String {
    let mut out = sql.to_string();
    for mapping in &ctx.incoming_mappings {
        if mapping.source_column.eq_ignore_ascii_case(&mapping.target_column) {
            continue;
        }
        let Some(target_table) = ctx.snapshot.table(&mapping.target_table) else {
            continue;
        };
        if target_table.has_column(&mapping.source_column)
            || !target_table.has_column(&mapping.target_column)
        {
            continue;
        }
        if contains_identifier(&out, &mapping.source_column) {
            out = replace_identifier(&out, &mapping.source_column, &mapping.target_column);
        }
    }
    out
}

/// True when the identifier already appears inside the SELECT list.
fn select_list_contains(sql: &str, ident: &str) -> bool {
    match select_list_span(sql) {
        Some((start, end)) => contains_identifier(&sql[start..end], ident),
        None => contains_identifier(sql, ident),
    }
}

/// Stage 17: every required mapping column must appear in the SELECT list
/// (and in GROUP BY when the query aggregates).
pub fn inject_mapping_columns(ctx: &RepairContext, sql: &str) -> String {
    let mut out = sql.to_string();

    for required in &ctx.required_columns {
        let alias_map = AliasMap::parse(&out);
        let Some(alias) = alias_map
            .alias_for_table(&required.table)
            .map(str::to_string)
        else {
            // Table absent even after the join stage; nothing to anchor on.
            continue;
        };
        let qualified = format!("{}.{}", alias, required.column);

        if !select_list_contains(&out, &required.column) {
            if let Some((start, _)) = select_list_span(&out) {
                out.insert_str(start, &format!("{}, ", qualified));
            }
        }

        let aggregating = select_list_span(&out)
            .map(|(s, e)| {
                split_top_level(&out[s..e], ',')
                    .iter()
                    .any(|item| is_aggregate_expr(item))
            })
            .unwrap_or(false);

        if let Some((start, end)) = clause_span(&out, "GROUP BY") {
            if !contains_identifier(&out[start..end], &required.column) {
                let body = out[start..end].trim().to_string();
                let rebuilt = if body.is_empty() {
                    format!(" {} ", qualified)
                } else {
                    format!(" {}, {} ", body, qualified)
                };
                out.replace_range(start..end, &rebuilt);
            }
        } else if aggregating {
            let point = group_by_insertion_point(&out);
            out.insert_str(point, &format!(" GROUP BY {}", qualified));
        }
    }
    out
}

/// Where a new GROUP BY belongs: before ORDER BY/LIMIT/…, else the end.
pub fn group_by_insertion_point(sql: &str) -> usize {
    let mut upper = sql.to_string();
    upper.make_ascii_uppercase();
    let mut best = sql.len();
    for head in ["ORDER BY", "HAVING", "LIMIT", "OFFSET"] {
        let mut search = 0usize;
        while let Some(pos) = upper[search..].find(head) {
            let idx = search + pos;
            let bytes = sql.as_bytes();
            let before_ok = idx == 0
                || !(bytes[idx - 1].is_ascii_alphanumeric() || bytes[idx - 1] == b'_');
            let after = idx + head.len();
            let after_ok = after >= bytes.len()
                || !(bytes[after].is_ascii_alphanumeric() || bytes[after] == b'_');
            if before_ok && after_ok && super::joins::at_top_level(sql, idx) {
                best = best.min(idx);
                break;
            }
            search = idx + 1;
        }
    }
    best
}

/// Stage 18: on the target side of a mapping, a `col IN (…)` result is
/// unreadable without context. Surface up to three descriptive columns from
/// the mapping table.
pub fn inject_descriptive_columns(ctx: &RepairContext, sql: &str) -> String {
    if ctx.incoming_mappings.is_empty() {
        return sql.to_string();
    }

    static IN_RE: OnceLock<Regex> = OnceLock::new();
    let mut out = sql.to_string();

    for mapping in &ctx.incoming_mappings {
        let in_re = IN_RE.get_or_init(|| {
            Regex::new(r#"(?i)[\[`"]?([A-Za-z_][A-Za-z0-9_]*)[\]`"]?\s+(?:NOT\s+)?IN\s*\("#)
                .unwrap()
        });
        let targets_in = in_re
            .captures_iter(&out)
            .any(|caps| caps[1].eq_ignore_ascii_case(&mapping.target_column));
        if !targets_in {
            continue;
        }

        let Some(table) = ctx.snapshot.table(&mapping.target_table) else {
            continue;
        };
        let alias_map = AliasMap::parse(&out);
        let Some(alias) = alias_map
            .alias_for_table(table.short_name())
            .map(str::to_string)
        else {
            continue;
        };

        let mut added = 0usize;
        for column in &table.columns {
            if added >= MAX_DESCRIPTIVE {
                break;
            }
            let descriptive = DESCRIPTIVE_NAMES.iter().any(|d| {
                column.name.eq_ignore_ascii_case(d)
                    || column.name.to_lowercase().ends_with(&d.to_lowercase())
            });
            if !descriptive || select_list_contains(&out, &column.name) {
                continue;
            }
            if let Some((start, _)) = select_list_span(&out) {
                out.insert_str(start, &format!("{}.{}, ", alias, column.name));
                added += 1;
            }
        }
    }
    out
}
