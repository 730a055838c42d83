// SPDX-License-Identifier: Apache-2.0

//! Shared state and token-scanning helpers for the repair cascade.
//!
//! The cascade never parses SQL fully; it works on bounded patterns. The
//! helpers here centralise the fiddly parts: identifier segmentation with
//! per-dialect quoting, alias maps, top-level clause spans, and
//! suffix-based fuzzy matching against the snapshot.

use std::sync::OnceLock;

use regex::Regex;

use crate::catalog::{SchemaSnapshot, TableSchema};
use crate::config::CrossMapping;
use crate::engine::dialect::SqlDialect;

/// One identifier segment: quoted in any dialect style, or bare.
pub const SEG: &str =
    r#"(?:\[[^\]\s.]+\]|"[^"\s.]+"|`[^`\s.]+`|[A-Za-z_][A-Za-z0-9_]*)"#;

/// Words that can never be a table alias.
const NON_ALIAS_WORDS: &[&str] = &[
    "ON", "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "JOIN", "LEFT", "RIGHT",
    "FULL", "INNER", "OUTER", "CROSS", "UNION", "AND", "OR", "AS", "SET", "SELECT", "BY",
    "FETCH", "TOP", "WITH",
];

/// Aggregate function heads recognised by the clause stages.
pub const AGGREGATES: &[&str] = &["COUNT", "SUM", "AVG", "MIN", "MAX"];

/// Non-aggregate functions a column name must not be confused with.
pub const SQL_FUNCTIONS: &[&str] = &[
    "COUNT", "SUM", "AVG", "MIN", "MAX", "UPPER", "LOWER", "LENGTH", "SUBSTR", "SUBSTRING",
    "ROUND", "ABS", "COALESCE", "IFNULL", "NULLIF", "CAST", "CONVERT", "TRIM", "REPLACE",
    "DATE", "DATETIME", "YEAR", "MONTH", "DAY", "NOW", "CONCAT", "GROUP_CONCAT", "STRING_AGG",
];

/// A column that must appear in a sub-plan's SELECT because it feeds (or
/// receives) cross-database value injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingColumn {
    pub table: String,
    pub column: String,
}

/// Everything a repair stage may consult about the target database.
pub struct RepairContext<'a> {
    pub snapshot: &'a SchemaSnapshot,
    pub dialect: SqlDialect,
    /// Lowercased names this database answers to (id, catalog, display).
    pub own_names: Vec<String>,
    /// Lowercased names of the other databases in the same plan.
    pub other_names: Vec<String>,
    /// Columns this sub-plan must project for cross-database mappings.
    pub required_columns: Vec<MappingColumn>,
    /// Mappings whose target side is this database.
    pub incoming_mappings: Vec<CrossMapping>,
}

impl<'a> RepairContext<'a> {
    pub fn new(
        snapshot: &'a SchemaSnapshot,
        other_names: Vec<String>,
        required_columns: Vec<MappingColumn>,
        incoming_mappings: Vec<CrossMapping>,
    ) -> Self {
        let mut own_names = vec![
            snapshot.db_id.to_lowercase(),
            snapshot.catalog_name.to_lowercase(),
            snapshot.display_name.to_lowercase(),
        ];
        own_names.dedup();
        Self {
            dialect: snapshot.dialect,
            snapshot,
            own_names,
            other_names,
            required_columns,
            incoming_mappings,
        }
    }

    pub fn is_own_name(&self, name: &str) -> bool {
        let lower = unquote(name).to_lowercase();
        self.own_names.contains(&lower)
    }

    pub fn is_other_db_name(&self, name: &str) -> bool {
        let lower = unquote(name).to_lowercase();
        self.other_names.contains(&lower)
    }

    /// The snapshot table whose short name has the longest common suffix
    /// with `name` (case-insensitive). Exact matches win outright.
    pub fn closest_table(&self, name: &str) -> Option<&'a TableSchema> {
        let needle = unquote(name).to_lowercase();
        if let Some(table) = self.snapshot.table(&needle) {
            return Some(table);
        }
        self.snapshot
            .tables
            .iter()
            .filter_map(|t| {
                let candidate = t.short_name().to_lowercase();
                let len = common_suffix_len(&needle, &candidate);
                // Demand a meaningful overlap, not a shared final letter.
                if len >= 3 || len == candidate.len() || len == needle.len() {
                    Some((len, t))
                } else {
                    None
                }
            })
            .max_by_key(|(len, _)| *len)
            .filter(|(len, _)| *len > 0)
            .map(|(_, t)| t)
    }

    /// The column of `table` with the longest common suffix with `name`.
    pub fn closest_column(&self, table: &TableSchema, name: &str) -> Option<String> {
        let needle = unquote(name).to_lowercase();
        if let Some(col) = table.column(&needle) {
            return Some(col.name.clone());
        }
        table
            .columns
            .iter()
            .filter_map(|c| {
                let candidate = c.name.to_lowercase();
                let len = common_suffix_len(&needle, &candidate);
                if len >= 2 {
                    Some((len, c.name.clone()))
                } else {
                    None
                }
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, name)| name)
    }

    /// Tables in the snapshot owning a column of this name.
    pub fn tables_with_column(&self, column: &str) -> Vec<&'a TableSchema> {
        self.snapshot
            .tables
            .iter()
            .filter(|t| t.has_column(unquote(column)))
            .collect()
    }

    /// A foreign key connecting the two tables, in either direction.
    /// Returns `(owning_table, fk)` where `owning_table` holds the FK.
    pub fn fk_between(
        &self,
        a: &str,
        b: &str,
    ) -> Option<(&'a TableSchema, &'a crate::catalog::ForeignKeyInfo)> {
        let ta = self.snapshot.table(a)?;
        let tb = self.snapshot.table(b)?;
        for fk in &ta.foreign_keys {
            if tb.matches_name(&fk.referenced_table) {
                return Some((ta, fk));
            }
        }
        for fk in &tb.foreign_keys {
            if ta.matches_name(&fk.referenced_table) {
                return Some((tb, fk));
            }
        }
        None
    }

    /// Quote a (possibly qualified) canonical table name for this dialect.
    pub fn quote_table(&self, qualified: &str) -> String {
        qualified
            .split('.')
            .map(|part| self.dialect.quote(part))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Strip one layer of dialect quoting from an identifier segment.
pub fn unquote(seg: &str) -> &str {
    let s = seg.trim();
    if (s.starts_with('[') && s.ends_with(']'))
        || (s.starts_with('"') && s.ends_with('"'))
        || (s.starts_with('`') && s.ends_with('`'))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn common_suffix_len(a: &str, b: &str) -> usize {
    a.bytes()
        .rev()
        .zip(b.bytes().rev())
        .take_while(|(x, y)| x.eq_ignore_ascii_case(y))
        .count()
}

/// `(alias_lower, table_as_written)` pairs from FROM/JOIN clauses. Tables
/// without an explicit alias map under their own (unquoted, lowered) short
/// name.
#[derive(Debug, Default)]
pub struct AliasMap {
    pairs: Vec<(String, String)>,
}

impl AliasMap {
    pub fn parse(sql: &str) -> Self {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(&format!(
                r"(?i)\b(?:FROM|JOIN)\s+({seg}(?:\.{seg}){{0,2}})(?:\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?",
                seg = SEG
            ))
            .unwrap()
        });

        let mut pairs = Vec::new();
        for caps in re.captures_iter(sql) {
            let table = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let table_short = table
                .rsplit('.')
                .next()
                .map(|s| unquote(s).to_string())
                .unwrap_or_default();
            let alias = caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .filter(|a| !NON_ALIAS_WORDS.iter().any(|w| a.eq_ignore_ascii_case(w)));
            match alias {
                Some(alias) => pairs.push((alias.to_lowercase(), table)),
                None => pairs.push((table_short.to_lowercase(), table)),
            }
        }
        Self { pairs }
    }

    /// The table an alias stands for, as written in the SQL.
    pub fn resolve(&self, alias: &str) -> Option<&str> {
        let lower = alias.to_lowercase();
        self.pairs
            .iter()
            .find(|(a, _)| *a == lower)
            .map(|(_, t)| t.as_str())
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.resolve(alias).is_some()
    }

    /// The alias (or implicit name) bound to a table, matched on the short
    /// name.
    pub fn alias_for_table(&self, table: &str) -> Option<&str> {
        let needle = unquote(table.rsplit('.').next().unwrap_or(table)).to_lowercase();
        self.pairs
            .iter()
            .find(|(_, t)| {
                unquote(t.rsplit('.').next().unwrap_or(t)).to_lowercase() == needle
            })
            .map(|(a, _)| a.as_str())
    }

    /// First declared (driving) entry.
    pub fn driving(&self) -> Option<(&str, &str)> {
        self.pairs.first().map(|(a, t)| (a.as_str(), t.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(a, t)| (a.as_str(), t.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Split on a separator at parenthesis depth zero, outside string literals.
pub fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_literal = false;
    let mut start = 0usize;
    for (idx, ch) in text.char_indices() {
        match ch {
            '\'' => in_literal = !in_literal,
            '(' if !in_literal => depth += 1,
            ')' if !in_literal => depth -= 1,
            c if c == separator && depth == 0 && !in_literal => {
                parts.push(&text[start..idx]);
                start = idx + ch.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Byte span of the SELECT list: after the leading SELECT (and DISTINCT /
/// TOP (n)) up to the matching top-level FROM.
pub fn select_list_span(sql: &str) -> Option<(usize, usize)> {
    static HEAD: OnceLock<Regex> = OnceLock::new();
    let head = HEAD.get_or_init(|| {
        Regex::new(r"(?i)^\s*SELECT\s+(?:DISTINCT\s+)?(?:TOP\s*\(\s*\d+\s*\)\s+)?").unwrap()
    });
    let m = head.find(sql)?;
    let start = m.end();

    let mut depth = 0i32;
    let mut in_literal = false;
    let bytes = sql.as_bytes();
    let mut i = start;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' => in_literal = !in_literal,
            '(' if !in_literal => depth += 1,
            ')' if !in_literal => depth -= 1,
            'F' | 'f' if !in_literal && depth == 0 => {
                if bytes.len() - i >= 4 && bytes[i..i + 4].eq_ignore_ascii_case(b"FROM") {
                    let before_ok = i == 0
                        || !(bytes[i - 1] as char).is_ascii_alphanumeric()
                            && bytes[i - 1] != b'_';
                    let after_ok = i + 4 >= bytes.len()
                        || !(bytes[i + 4] as char).is_ascii_alphanumeric()
                            && bytes[i + 4] != b'_';
                    if before_ok && after_ok {
                        return Some((start, i));
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Byte span of a trailing clause body (e.g. `GROUP BY`, `ORDER BY`) at
/// top level: from after the keyword to the start of the next clause.
pub fn clause_span(sql: &str, clause: &str) -> Option<(usize, usize)> {
    // ASCII-only uppercasing keeps byte offsets aligned with the original.
    let mut upper = sql.to_string();
    upper.make_ascii_uppercase();
    let mut clause_upper = clause.to_string();
    clause_upper.make_ascii_uppercase();
    let mut idx = find_top_level(sql, &upper, &clause_upper)?;
    idx += clause_upper.len();

    let terminators = ["GROUP BY", "ORDER BY", "HAVING", "LIMIT", "OFFSET", "FETCH"];
    let mut end = sql.len();
    for term in terminators {
        if term == clause_upper {
            continue;
        }
        if let Some(pos) = find_top_level_from(sql, &upper, term, idx) {
            end = end.min(pos);
        }
    }
    Some((idx, end))
}

fn find_top_level(sql: &str, upper: &str, needle: &str) -> Option<usize> {
    find_top_level_from(sql, upper, needle, 0)
}

fn find_top_level_from(sql: &str, upper: &str, needle: &str, from: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_literal = false;
    let bytes = sql.as_bytes();
    let needle_bytes = needle.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' => in_literal = !in_literal,
            '(' if !in_literal => depth += 1,
            ')' if !in_literal => depth -= 1,
            _ => {}
        }
        if !in_literal
            && depth == 0
            && i >= from
            && upper.as_bytes()[i..].starts_with(needle_bytes)
        {
            let before_ok =
                i == 0 || !(bytes[i - 1] as char).is_ascii_alphanumeric() && bytes[i - 1] != b'_';
            let after = i + needle_bytes.len();
            let after_ok = after >= bytes.len()
                || !(bytes[after] as char).is_ascii_alphanumeric() && bytes[after] != b'_';
            if before_ok && after_ok {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// True when the expression is (or contains) an aggregate call.
pub fn is_aggregate_expr(expr: &str) -> bool {
    let upper = expr.to_uppercase();
    AGGREGATES.iter().any(|agg| {
        upper
            .match_indices(agg)
            .any(|(idx, _)| {
                let before_ok = idx == 0
                    || !upper.as_bytes()[idx - 1].is_ascii_alphanumeric()
                        && upper.as_bytes()[idx - 1] != b'_';
                let rest = upper[idx + agg.len()..].trim_start();
                before_ok && rest.starts_with('(')
            })
    })
}

/// Names the statement itself defines and the snapshot knows nothing
/// about: CTE names and derived-table aliases. References through them are
/// opaque to schema validation.
pub fn opaque_aliases(sql: &str) -> Vec<String> {
    static CTE_RE: OnceLock<Regex> = OnceLock::new();
    static DERIVED_RE: OnceLock<Regex> = OnceLock::new();

    let mut names = Vec::new();

    let head_is_with = words_head(sql).eq_ignore_ascii_case("WITH");
    if head_is_with {
        let cte_re = CTE_RE
            .get_or_init(|| Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_]*)\s+AS\s*\(").unwrap());
        for caps in cte_re.captures_iter(sql) {
            let name = caps[1].to_lowercase();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    let derived_re = DERIVED_RE
        .get_or_init(|| Regex::new(r"\)\s+(?:(?i:AS)\s+)?([A-Za-z_][A-Za-z0-9_]*)").unwrap());
    for caps in derived_re.captures_iter(sql) {
        let name = caps[1].to_lowercase();
        let is_keyword = NON_ALIAS_WORDS.iter().any(|w| name.eq_ignore_ascii_case(w));
        if !is_keyword && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn words_head(sql: &str) -> &str {
    sql.trim_start()
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .next()
        .unwrap_or("")
}

/// Case-insensitive whole-word presence of an identifier.
pub fn contains_identifier(sql: &str, ident: &str) -> bool {
    let sql_bytes = sql.as_bytes();
    let mut lower = sql.to_string();
    lower.make_ascii_lowercase();
    let mut needle = ident.to_string();
    needle.make_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find(needle.as_str()) {
        let idx = from + pos;
        let before_ok = idx == 0
            || !(sql_bytes[idx - 1].is_ascii_alphanumeric() || sql_bytes[idx - 1] == b'_');
        let after = idx + needle.len();
        let after_ok = after >= sql_bytes.len()
            || !(sql_bytes[after].is_ascii_alphanumeric() || sql_bytes[after] == b'_');
        if before_ok && after_ok {
            return true;
        }
        from = idx + needle.len().max(1);
    }
    false
}
