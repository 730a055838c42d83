// SPDX-License-Identifier: Apache-2.0

//! Extraction of per-database SQL from the model response.
//!
//! The happy path is a deterministic line-wise state machine over the wire
//! format (`DATABASE k: name`, `CONFIRMED`, fenced SQL). When the model
//! ignores the format entirely, a `;`-split fallback assigns candidate
//! statements to sub-plans by declared order, then by schema-mention score.

use std::sync::OnceLock;

use regex::Regex;

use crate::engine::dialect::strip_fences;

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:#+\s*)?\**DATABASE\s+(\d+)\s*:").unwrap()
    })
}

fn confirmed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\**CONFIRMED\**:?\s*$").unwrap())
}

fn prose_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(Explanation|Note|Output|Result)\s*:").unwrap())
}

fn sql_head(line: &str) -> bool {
    let trimmed = line.trim_start();
    let mut upper = trimmed.to_string();
    upper.make_ascii_uppercase();
    upper.starts_with("SELECT") || upper.starts_with("WITH")
}

/// Extract one optional SQL string per sub-plan. `score_tables[k]` holds the
/// table names of sub-plan `k`'s snapshot, used only by the fallback.
pub fn extract(response: &str, plan_count: usize, score_tables: &[Vec<String>]) -> Vec<Option<String>> {
    let mut buffers: Vec<String> = vec![String::new(); plan_count];
    let mut current: Option<usize> = None;
    let mut in_sql = false;
    let mut found_marker = false;

    for line in response.lines() {
        let trimmed = line.trim();

        if let Some(caps) = header_re().captures(trimmed) {
            found_marker = true;
            in_sql = false;
            current = caps[1]
                .parse::<usize>()
                .ok()
                .filter(|k| (1..=plan_count).contains(k))
                .map(|k| k - 1);
            continue;
        }

        let Some(db) = current else { continue };

        if trimmed.starts_with("```") {
            // Opening fences are transparent; a closing fence ends the SQL.
            if in_sql {
                in_sql = false;
            }
            continue;
        }

        if confirmed_re().is_match(trimmed) {
            in_sql = true;
            continue;
        }

        if in_sql {
            if prose_re().is_match(trimmed) {
                in_sql = false;
                continue;
            }
            if !trimmed.is_empty() {
                if !buffers[db].is_empty() {
                    buffers[db].push('\n');
                }
                buffers[db].push_str(trimmed);
            }
            continue;
        }

        // CONFIRMED was omitted but the SQL is unmistakable.
        if sql_head(trimmed) && buffers[db].is_empty() {
            in_sql = true;
            buffers[db].push_str(trimmed);
        }
    }

    if found_marker {
        return buffers
            .into_iter()
            .map(|b| {
                let t = b.trim().to_string();
                if t.is_empty() { None } else { Some(t) }
            })
            .collect();
    }

    fallback_split(response, plan_count, score_tables)
}

/// No database markers at all: split on `;`, keep SELECT/WITH chunks, and
/// assign them to sub-plans.
fn fallback_split(
    response: &str,
    plan_count: usize,
    score_tables: &[Vec<String>],
) -> Vec<Option<String>> {
    let cleaned = strip_fences(response);
    let mut candidates: Vec<String> = Vec::new();

    for chunk in cleaned.split(';') {
        // Skip prose ahead of the statement inside the chunk.
        let Some(start) = chunk
            .lines()
            .scan(0usize, |offset, line| {
                let line_offset = *offset;
                *offset += line.len() + 1;
                Some((line_offset, line))
            })
            .find(|(_, line)| sql_head(line))
            .map(|(offset, _)| offset)
        else {
            continue;
        };
        let statement = chunk[start..].trim().to_string();
        if !statement.is_empty() {
            candidates.push(statement);
        }
    }

    if candidates.is_empty() {
        return vec![None; plan_count];
    }

    if candidates.len() == plan_count {
        return candidates.into_iter().map(Some).collect();
    }

    // Ambiguous: greedy assignment by snapshot-mention score, declared
    // order breaking ties.
    let mut assigned: Vec<Option<String>> = vec![None; plan_count];
    let mut used = vec![false; candidates.len()];
    for k in 0..plan_count {
        let tables = score_tables.get(k).cloned().unwrap_or_default();
        let mut best: Option<(usize, usize)> = None;
        for (idx, candidate) in candidates.iter().enumerate() {
            if used[idx] {
                continue;
            }
            let score = tables
                .iter()
                .filter(|t| super::repair::context::contains_identifier(candidate, t))
                .count();
            let better = match best {
                None => true,
                Some((_, best_score)) => score > best_score,
            };
            if better {
                best = Some((idx, score));
            }
        }
        if let Some((idx, _)) = best {
            used[idx] = true;
            assigned[k] = Some(candidates[idx].clone());
        }
    }
    assigned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_marked_blocks() {
        let response = "\
### DATABASE 1: shop
CONFIRMED
```sql
SELECT id, total FROM orders
ORDER BY total DESC
```

### DATABASE 2: crm
CONFIRMED
```sql
SELECT id FROM customers
```
";
        let out = extract(response, 2, &[]);
        assert_eq!(
            out[0].as_deref(),
            Some("SELECT id, total FROM orders\nORDER BY total DESC")
        );
        assert_eq!(out[1].as_deref(), Some("SELECT id FROM customers"));
    }

    #[test]
    fn tolerates_missing_confirmed() {
        let response = "\
DATABASE 1: shop
SELECT id FROM orders
";
        let out = extract(response, 1, &[]);
        assert_eq!(out[0].as_deref(), Some("SELECT id FROM orders"));
    }

    #[test]
    fn prose_lines_close_the_buffer() {
        let response = "\
DATABASE 1: shop
CONFIRMED
SELECT id FROM orders
Explanation: this selects the ids
";
        let out = extract(response, 1, &[]);
        assert_eq!(out[0].as_deref(), Some("SELECT id FROM orders"));
    }

    #[test]
    fn out_of_range_header_is_ignored() {
        let response = "\
DATABASE 7: mystery
CONFIRMED
SELECT 1
";
        let out = extract(response, 2, &[]);
        assert_eq!(out, vec![None, None]);
    }

    #[test]
    fn fallback_splits_on_semicolons_in_order() {
        let response = "SELECT id FROM orders; SELECT id FROM customers;";
        let out = extract(response, 2, &[]);
        assert_eq!(out[0].as_deref(), Some("SELECT id FROM orders"));
        assert_eq!(out[1].as_deref(), Some("SELECT id FROM customers"));
    }

    #[test]
    fn fallback_scores_by_table_mentions() {
        let response = "\
Here are the queries you need:
SELECT id FROM customers;
SELECT total FROM orders;
Some trailing words.
";
        let score_tables = vec![
            vec!["orders".to_string()],
            vec!["customers".to_string()],
            vec!["inventory".to_string()],
        ];
        let out = extract(response, 3, &score_tables);
        assert_eq!(out[0].as_deref(), Some("SELECT total FROM orders"));
        assert_eq!(out[1].as_deref(), Some("SELECT id FROM customers"));
        assert_eq!(out[2], None);
    }
}
