// SPDX-License-Identifier: Apache-2.0

//! Value plumbing for priority-mode execution: harvesting mapped column
//! values out of a source result body, and substituting them into the
//! target query's `IN (…)` predicate.

use regex::Regex;

use crate::engine::types::ROWS_EXTRACTED_PREFIX;

/// Lines that are framing, not data.
fn is_metadata(line: &str) -> bool {
    line.starts_with("===")
        || line.starts_with("Query:")
        || line.starts_with("Rows")
}

/// Parse a tab-delimited result body and collect the non-null, non-empty
/// values of one column, deduplicated in first-seen order.
pub fn extract_column_values(body: &str, column: &str) -> Vec<String> {
    let mut lines = body.lines().filter(|l| !l.trim().is_empty());

    let header = loop {
        match lines.next() {
            Some(line) if is_metadata(line.trim()) => continue,
            Some(line) => break line,
            None => return Vec::new(),
        }
    };

    let Some(idx) = header
        .split('\t')
        .position(|h| h.trim().eq_ignore_ascii_case(column))
    else {
        return Vec::new();
    };

    let mut values: Vec<String> = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with(ROWS_EXTRACTED_PREFIX) || trimmed.starts_with("===") {
            break;
        }
        let Some(cell) = line.split('\t').nth(idx) else { continue };
        let cell = cell.trim();
        if cell.is_empty() || cell == "NULL" || cell == "[SENSITIVE_DATA]" {
            continue;
        }
        if !values.iter().any(|v| v == cell) {
            values.push(cell.to_string());
        }
    }
    values
}

/// Render a value list for an `IN (…)` predicate. Numeric sets stay bare;
/// anything else is quoted with `''` escaping.
fn render_values(values: &[String]) -> String {
    let all_numeric = values
        .iter()
        .all(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-'));
    values
        .iter()
        .map(|v| {
            if all_numeric {
                v.clone()
            } else {
                format!("'{}'", v.replace('\'', "''"))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Substitute collected source values into the target query.
///
/// Locates `column IN (…)` (tolerating alias prefixes and any quoting
/// style) and overwrites the list. An empty value set collapses the
/// predicate to `1=0`. Returns the SQL unchanged when the pattern is
/// absent.
pub fn inject_values(sql: &str, column: &str, values: &[String]) -> (String, bool) {
    let pattern = format!(
        r#"(?i)((?:[A-Za-z_][A-Za-z0-9_]*\.)?[\[`"]?{}[\]`"]?)(\s+NOT)?\s+IN\s*\([^)]*\)"#,
        regex::escape(column)
    );
    let re = Regex::new(&pattern).expect("escaped predicate pattern");

    if !re.is_match(sql) {
        return (sql.to_string(), false);
    }

    let out = re
        .replace_all(sql, |caps: &regex::Captures| {
            if values.is_empty() {
                "1=0".to_string()
            } else {
                let negate = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                format!("{}{} IN ({})", &caps[1], negate, render_values(values))
            }
        })
        .into_owned();
    (out, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "id\tname\tcity\n1\tAda\tParis\n2\tNULL\tLyon\n3\tGrace\t\nRows extracted: 3\n";

    #[test]
    fn extracts_column_values_skipping_nulls() {
        assert_eq!(extract_column_values(BODY, "id"), vec!["1", "2", "3"]);
        assert_eq!(extract_column_values(BODY, "NAME"), vec!["Ada", "Grace"]);
        assert_eq!(extract_column_values(BODY, "city"), vec!["Paris", "Lyon"]);
        assert!(extract_column_values(BODY, "missing").is_empty());
    }

    #[test]
    fn extraction_skips_metadata_lines() {
        let body = "=== shop ===\nQuery: SELECT id FROM t\nid\n7\n7\n8\nRows extracted: 3\n";
        assert_eq!(extract_column_values(body, "id"), vec!["7", "8"]);
    }

    #[test]
    fn injects_numeric_values_bare() {
        let sql = "SELECT * FROM orders WHERE customer_id IN (0)";
        let (out, changed) =
            inject_values(sql, "customer_id", &["1".into(), "2".into(), "3".into()]);
        assert!(changed);
        assert_eq!(out, "SELECT * FROM orders WHERE customer_id IN (1, 2, 3)");
    }

    #[test]
    fn injects_quoted_values_and_alias_prefix() {
        let sql = "SELECT * FROM orders o WHERE o.customer_id IN ('x')";
        let (out, _) = inject_values(sql, "customer_id", &["a'b".into(), "c".into()]);
        assert_eq!(
            out,
            "SELECT * FROM orders o WHERE o.customer_id IN ('a''b', 'c')"
        );
    }

    #[test]
    fn tolerates_bracket_quoting() {
        let sql = "SELECT * FROM Orders WHERE [customer_id] IN (SELECT 1)";
        let (out, changed) = inject_values(sql, "customer_id", &["5".into()]);
        assert!(changed);
        assert_eq!(out, "SELECT * FROM Orders WHERE [customer_id] IN (5)");
    }

    #[test]
    fn empty_source_collapses_to_false() {
        let sql = "SELECT * FROM orders WHERE customer_id IN (0)";
        let (out, changed) = inject_values(sql, "customer_id", &[]);
        assert!(changed);
        assert_eq!(out, "SELECT * FROM orders WHERE 1=0");
    }

    #[test]
    fn absent_pattern_is_skipped() {
        let sql = "SELECT * FROM orders WHERE total > 5";
        let (out, changed) = inject_values(sql, "customer_id", &["1".into()]);
        assert!(!changed);
        assert_eq!(out, sql);
    }

    #[test]
    fn not_in_is_preserved() {
        let sql = "SELECT * FROM orders WHERE customer_id NOT IN (0)";
        let (out, _) = inject_values(sql, "customer_id", &["4".into()]);
        assert_eq!(out, "SELECT * FROM orders WHERE customer_id NOT IN (4)");
    }
}
