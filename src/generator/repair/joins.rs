// SPDX-License-Identifier: Apache-2.0

//! Structural repairs around FROM/JOIN: invalid subqueries, JOINs against
//! tables the snapshot does not know, and joins injected to reach columns
//! the query needs (aggregate arguments, mapping columns).

use std::sync::OnceLock;

use regex::Regex;

use super::context::{
    split_top_level, unquote, AliasMap, MappingColumn, RepairContext, SEG,
};

/// One parsed JOIN clause with byte spans into the SQL.
#[derive(Debug)]
struct JoinClause {
    /// Start of the join head (including LEFT/INNER/… prefix).
    start: usize,
    /// End of the whole clause (exclusive).
    end: usize,
    table: String,
    alias: String,
    /// Span of the ON condition body.
    on_span: Option<(usize, usize)>,
}

fn join_head_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)\b(?:(?:LEFT|RIGHT|FULL|INNER|CROSS)\s+(?:OUTER\s+)?)?JOIN\s+({seg}(?:\.{seg}){{0,2}})(?:\s+(?:AS\s+)?(?P<alias>[A-Za-z_][A-Za-z0-9_]*))?",
            seg = SEG
        ))
        .unwrap()
    })
}

/// Terminators that end a join clause at top level.
const CLAUSE_HEADS: &[&str] = &[
    "LEFT JOIN", "RIGHT JOIN", "FULL JOIN", "INNER JOIN", "CROSS JOIN", "JOIN", "WHERE",
    "GROUP BY", "ORDER BY", "HAVING", "LIMIT", "OFFSET",
];

const NON_ALIAS: &[&str] = &[
    "ON", "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "JOIN", "LEFT", "RIGHT", "FULL",
    "INNER", "OUTER", "CROSS", "AND", "OR",
];

fn parse_joins(sql: &str) -> Vec<JoinClause> {
    let mut joins = Vec::new();
    for caps in join_head_re().captures_iter(sql) {
        let whole = caps.get(0).unwrap();
        if !at_top_level(sql, whole.start()) {
            continue;
        }
        let table = caps.get(1).unwrap().as_str().to_string();
        let alias_match = caps.name("alias").filter(|m| {
            !NON_ALIAS.iter().any(|w| m.as_str().eq_ignore_ascii_case(w))
        });
        let alias = alias_match
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| {
                unquote(table.rsplit('.').next().unwrap_or(&table)).to_string()
            });
        let head_end = alias_match.map(|m| m.end()).unwrap_or_else(|| caps.get(1).unwrap().end());

        let clause_end = next_clause_head(sql, head_end).unwrap_or(sql.len());

        // ON body, when present, runs from after "ON" to the clause end.
        let on_span = find_on(sql, head_end, clause_end);

        joins.push(JoinClause {
            start: whole.start(),
            end: clause_end,
            table,
            alias,
            on_span,
        });
    }
    joins
}

/// True when the byte offset sits at parenthesis depth zero outside literals.
pub(crate) fn at_top_level(sql: &str, offset: usize) -> bool {
    let mut depth = 0i32;
    let mut in_literal = false;
    for (idx, ch) in sql.char_indices() {
        if idx >= offset {
            break;
        }
        match ch {
            '\'' => in_literal = !in_literal,
            '(' if !in_literal => depth += 1,
            ')' if !in_literal => depth -= 1,
            _ => {}
        }
    }
    depth == 0 && !in_literal
}

fn next_clause_head(sql: &str, from: usize) -> Option<usize> {
    let mut upper = sql.to_string();
    upper.make_ascii_uppercase();
    let mut best: Option<usize> = None;
    for head in CLAUSE_HEADS {
        let mut search = from;
        while let Some(pos) = upper[search..].find(head) {
            let idx = search + pos;
            let bytes = sql.as_bytes();
            let before_ok = idx == 0
                || !(bytes[idx - 1].is_ascii_alphanumeric() || bytes[idx - 1] == b'_');
            let after = idx + head.len();
            let after_ok = after >= bytes.len()
                || !(bytes[after].is_ascii_alphanumeric() || bytes[after] == b'_');
            if before_ok && after_ok && at_top_level(sql, idx) {
                best = Some(best.map_or(idx, |b: usize| b.min(idx)));
                break;
            }
            search = idx + 1;
        }
    }
    best
}

fn find_on(sql: &str, from: usize, until: usize) -> Option<(usize, usize)> {
    let mut upper = sql.to_string();
    upper.make_ascii_uppercase();
    let slice = &upper[from..until];
    let mut search = 0usize;
    while let Some(pos) = slice[search..].find("ON") {
        let idx = from + search + pos;
        let bytes = sql.as_bytes();
        let before_ok =
            idx == 0 || !(bytes[idx - 1].is_ascii_alphanumeric() || bytes[idx - 1] == b'_');
        let after = idx + 2;
        let after_ok = after >= bytes.len()
            || !(bytes[after].is_ascii_alphanumeric() || bytes[after] == b'_');
        if before_ok && after_ok && at_top_level(sql, idx) {
            return Some((after, until));
        }
        search = search + pos + 1;
    }
    None
}

/// Position where an injected JOIN belongs: just before the first top-level
/// WHERE/GROUP BY/ORDER BY/…, or the end of the statement.
fn injection_point(sql: &str) -> usize {
    let mut upper = sql.to_string();
    upper.make_ascii_uppercase();
    let mut best = sql.len();
    for head in ["WHERE", "GROUP BY", "ORDER BY", "HAVING", "LIMIT", "OFFSET"] {
        let mut search = 0usize;
        while let Some(pos) = upper[search..].find(head) {
            let idx = search + pos;
            let bytes = sql.as_bytes();
            let before_ok = idx == 0
                || !(bytes[idx - 1].is_ascii_alphanumeric() || bytes[idx - 1] == b'_');
            let after = idx + head.len();
            let after_ok = after >= bytes.len()
                || !(bytes[after].is_ascii_alphanumeric() || bytes[after] == b'_');
            if before_ok && after_ok && at_top_level(sql, idx) {
                best = best.min(idx);
                break;
            }
            search = idx + 1;
        }
    }
    best
}

/// Stage 4: parenthesised subqueries whose FROM names an unknown table are
/// neutralised: predicate position becomes `1=1`, expression position
/// becomes `NULL`. Derived tables in FROM are left alone.
pub fn remove_invalid_subqueries(ctx: &RepairContext, sql: &str) -> String {
    static FROM_RE: OnceLock<Regex> = OnceLock::new();
    let from_re = FROM_RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)\bFROM\s+({seg}(?:\.{seg}){{0,2}})", seg = SEG)).unwrap()
    });

    let mut out = sql.to_string();
    loop {
        let mut replaced = false;
        let mut upper = out.clone();
        upper.make_ascii_uppercase();

        let mut search = 0usize;
        while let Some(pos) = upper[search..].find("(SELECT") {
            let open = search + pos;
            let Some(close) = matching_paren(&out, open) else {
                search = open + 1;
                continue;
            };
            let inner = &out[open + 1..close];
            let table_ok = from_re
                .captures(inner)
                .map(|caps| {
                    let name = unquote(caps.get(1).unwrap().as_str());
                    ctx.snapshot.has_table(name)
                        || name.contains('.')
                            && ctx.snapshot.has_table(name.rsplit('.').next().unwrap_or(name))
                })
                // A subquery with no FROM (SELECT 1) is harmless.
                .unwrap_or(true);

            if table_ok {
                search = close + 1;
                continue;
            }

            // What precedes the subquery decides the replacement.
            let prefix = out[..open].trim_end();
            let prefix_upper = {
                let mut p = prefix.to_string();
                p.make_ascii_uppercase();
                p
            };

            if prefix_upper.ends_with("FROM")
                || prefix_upper.ends_with("JOIN")
                || prefix_upper.ends_with("AS")
            {
                // Derived table or CTE body; out of scope for this stage.
                search = close + 1;
                continue;
            }

            let (cut_start, replacement) = predicate_cut(prefix, &prefix_upper);
            let replacement = replacement.to_string();
            out.replace_range(cut_start..close + 1, &replacement);
            replaced = true;
            break;
        }
        if !replaced {
            return out;
        }
    }
}

/// Decide how much predicate to excise before a dead subquery and what to
/// put there instead.
fn predicate_cut(prefix: &str, prefix_upper: &str) -> (usize, &'static str) {
    for op in ["NOT IN", "IN", "NOT EXISTS", "EXISTS", ">=", "<=", "<>", "!=", "=", "<", ">"] {
        if prefix_upper.ends_with(op) {
            let op_start = prefix.len() - op.len();
            if op.contains("EXISTS") {
                return (op_start, "1=1");
            }
            // Walk back over the left operand (a dotted identifier).
            let left = prefix[..op_start].trim_end();
            let operand_start = left
                .rfind(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                .map(|i| i + 1)
                .unwrap_or(0);
            return (operand_start, "1=1");
        }
    }
    (prefix.len(), " NULL")
}

fn matching_paren(sql: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_literal = false;
    for (idx, ch) in sql[open..].char_indices() {
        match ch {
            '\'' => in_literal = !in_literal,
            '(' if !in_literal => depth += 1,
            ')' if !in_literal => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Stage 5: remove JOINs against unknown tables, scrub references to the
/// aliases they defined, and re-derive broken ON conditions from foreign
/// keys between the remaining tables.
pub fn remove_invalid_joins(ctx: &RepairContext, sql: &str) -> String {
    let joins = parse_joins(sql);
    let opaque = super::context::opaque_aliases(sql);
    let mut removed_aliases: Vec<String> = Vec::new();
    let mut out = sql.to_string();

    // Remove from the back so spans stay valid.
    for join in joins.iter().rev() {
        let bare = unquote(join.table.rsplit('.').next().unwrap_or(&join.table));
        let known = ctx.snapshot.has_table(unquote(&join.table))
            || ctx.snapshot.has_table(bare)
            || opaque.contains(&bare.to_lowercase())
            || join.table.starts_with('(');
        if !known {
            removed_aliases.push(join.alias.to_lowercase());
            out.replace_range(join.start..join.end, "");
        }
    }

    if !removed_aliases.is_empty() {
        out = scrub_alias_references(&out, &removed_aliases);
        out = repair_on_conditions(ctx, &out);
    }
    out
}

/// Drop SELECT-list items and WHERE terms that reference a removed alias.
fn scrub_alias_references(sql: &str, removed: &[String]) -> String {
    let references = |text: &str| {
        removed.iter().any(|alias| {
            let needle = format!("{}.", alias);
            let mut lower = text.to_string();
            lower.make_ascii_lowercase();
            lower
                .match_indices(&needle)
                .any(|(idx, _)| {
                    idx == 0
                        || !(lower.as_bytes()[idx - 1].is_ascii_alphanumeric()
                            || lower.as_bytes()[idx - 1] == b'_')
                })
        })
    };

    let mut out = sql.to_string();

    if let Some((start, end)) = super::context::select_list_span(&out) {
        let items = split_top_level(&out[start..end], ',');
        let kept: Vec<&str> = items
            .iter()
            .map(|s| *s)
            .filter(|item| !references(item))
            .collect();
        let rebuilt = if kept.is_empty() {
            // Leave the empty SELECT for the dedicated stage to fill.
            " ".to_string()
        } else {
            kept.iter()
                .map(|s| s.trim())
                .collect::<Vec<_>>()
                .join(", ")
                + " "
        };
        out.replace_range(start..end, &rebuilt);
    }

    if let Some((start, end)) = where_span(&out) {
        let body = out[start..end].to_string();
        let rebuilt = rebuild_condition(&body, &|term| !references(term));
        match rebuilt {
            Some(new_body) => out.replace_range(start..end, &new_body),
            None => {
                // The whole WHERE died.
                let mut upper = out[..start].to_string();
                upper.make_ascii_uppercase();
                let head_start = upper.rfind("WHERE").unwrap_or(start);
                out.replace_range(head_start..end, "");
            }
        }
    }

    out
}

fn where_span(sql: &str) -> Option<(usize, usize)> {
    super::context::clause_span(sql, "WHERE")
}

/// Filter AND/OR terms; `None` when nothing survives.
fn rebuild_condition(body: &str, keep: &dyn Fn(&str) -> bool) -> Option<String> {
    // Split on top-level AND first, then OR inside each piece.
    let mut terms: Vec<String> = Vec::new();
    for chunk in split_condition(body, "AND") {
        let ors = split_condition(&chunk, "OR");
        let kept: Vec<String> = ors.into_iter().filter(|t| keep(t.trim())).collect();
        if !kept.is_empty() {
            terms.push(kept.join(" OR "));
        }
    }
    if terms.is_empty() {
        None
    } else {
        Some(format!(" {} ", terms.join(" AND ").trim()))
    }
}

fn split_condition(body: &str, op: &str) -> Vec<String> {
    let mut upper = body.to_string();
    upper.make_ascii_uppercase();
    let needle = op.to_uppercase();
    let bytes = body.as_bytes();

    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_literal = false;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' => in_literal = !in_literal,
            '(' if !in_literal => depth += 1,
            ')' if !in_literal => depth -= 1,
            _ => {}
        }
        if !in_literal && depth == 0 && upper[i..].starts_with(&needle) {
            let before_ok =
                i == 0 || !(bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_');
            let after = i + needle.len();
            let after_ok = after >= bytes.len()
                || !(bytes[after].is_ascii_alphanumeric() || bytes[after] == b'_');
            if before_ok && after_ok {
                parts.push(body[start..i].to_string());
                start = after;
                i = after;
                continue;
            }
        }
        i += 1;
    }
    parts.push(body[start..].to_string());
    parts
}

/// Rewrite ON conditions that reference aliases no longer in the query,
/// deriving a replacement from a foreign key between the joined table and
/// the driving table.
fn repair_on_conditions(ctx: &RepairContext, sql: &str) -> String {
    let alias_map = AliasMap::parse(sql);
    let joins = parse_joins(sql);
    let mut out = sql.to_string();

    for join in joins.iter().rev() {
        let Some((on_start, on_end)) = join.on_span else { continue };
        let condition = &sql[on_start..on_end];

        let broken = condition_mentions_unknown_alias(ctx, condition, &alias_map);
        if !broken {
            continue;
        }

        if let Some(rewritten) = fk_condition(ctx, &alias_map, &join.table, &join.alias) {
            out.replace_range(on_start..on_end, &format!(" {} ", rewritten));
        } else {
            out.replace_range(on_start..on_end, " 1=1 ");
        }
    }
    out
}

fn condition_mentions_unknown_alias(
    ctx: &RepairContext,
    condition: &str,
    alias_map: &AliasMap,
) -> bool {
    static REF_RE: OnceLock<Regex> = OnceLock::new();
    let re = REF_RE.get_or_init(|| {
        Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.[A-Za-z_\[`\x22]").unwrap()
    });
    re.captures_iter(condition).any(|caps| {
        let head = &caps[1];
        !alias_map.contains(head)
            && !ctx.snapshot.has_table(head)
            && !is_schema_name(ctx, head)
    })
}

/// True when the word is the schema part of some qualified table name.
fn is_schema_name(ctx: &RepairContext, word: &str) -> bool {
    ctx.snapshot.tables.iter().any(|t| {
        t.qualified_name
            .split('.')
            .next()
            .is_some_and(|schema| schema.eq_ignore_ascii_case(word) && t.qualified_name.contains('.'))
    })
}

/// An ON condition joining `table` (aliased `alias`) to some other table in
/// the query along a foreign key.
fn fk_condition(
    ctx: &RepairContext,
    alias_map: &AliasMap,
    table: &str,
    alias: &str,
) -> Option<String> {
    let own_short = unquote(table.rsplit('.').next().unwrap_or(table));
    for (other_alias, other_table) in alias_map.iter() {
        let other_short = unquote(other_table.rsplit('.').next().unwrap_or(other_table));
        if other_short.eq_ignore_ascii_case(own_short) {
            continue;
        }
        if let Some((owner, fk)) = ctx.fk_between(own_short, other_short) {
            let owner_is_self = owner.matches_name(own_short);
            let (left_alias, right_alias) = if owner_is_self {
                (alias, other_alias)
            } else {
                (other_alias, alias)
            };
            return Some(format!(
                "{}.{} = {}.{}",
                left_alias, fk.local_column, right_alias, fk.referenced_column
            ));
        }
    }
    None
}

/// Stage 12: aggregate arguments pointing at columns the aliased table does
/// not own. When another snapshot table owns the column and is reachable by
/// a foreign key, join it in and retarget the argument.
pub fn repair_aggregate_args(ctx: &RepairContext, sql: &str) -> String {
    static AGG_RE: OnceLock<Regex> = OnceLock::new();
    let re = AGG_RE.get_or_init(|| {
        Regex::new(r"(?i)\b(COUNT|SUM|AVG|MIN|MAX)\s*\(\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\s*\)")
            .unwrap()
    });

    let mut out = sql.to_string();

    // Fixpoint loop: one repair per iteration keeps spans simple.
    for _ in 0..8 {
        let current = out.clone();
        let alias_map = AliasMap::parse(&current);
        let mut changed = false;

        for caps in re.captures_iter(&current) {
            let (alias, column) = (&caps[2], &caps[3]);
            if let Some(table_name) = alias_map.resolve(alias) {
                let bare = unquote(table_name.rsplit('.').next().unwrap_or(table_name));
                if let Some(table) = ctx.snapshot.table(bare) {
                    if table.has_column(column) {
                        continue;
                    }
                }
            }

            // The alias/column pair is broken. Find the column's real owner.
            for owner in ctx.tables_with_column(column) {
                let owner_short = owner.short_name().to_string();

                if let Some(existing_alias) = alias_map.alias_for_table(&owner_short) {
                    // Owner is already in the query; rebind the argument.
                    let fixed = format!("{}({}.{})", &caps[1], existing_alias, column);
                    out = current.replacen(&caps[0], &fixed, 1);
                    changed = true;
                    break;
                }

                // Join the owner in along a foreign key to a present table.
                let mut joined = false;
                for (q_alias, q_table) in alias_map.iter() {
                    let q_short = unquote(q_table.rsplit('.').next().unwrap_or(q_table));
                    if let Some((fk_owner, fk)) = ctx.fk_between(&owner_short, q_short) {
                        let owner_is_new = fk_owner.matches_name(&owner_short);
                        let condition = if owner_is_new {
                            format!(
                                "{}.{} = {}.{}",
                                owner_short, fk.local_column, q_alias, fk.referenced_column
                            )
                        } else {
                            format!(
                                "{}.{} = {}.{}",
                                q_alias, fk.local_column, owner_short, fk.referenced_column
                            )
                        };
                        let join_clause = format!(
                            " INNER JOIN {} ON {}",
                            ctx.quote_table(&owner.qualified_name),
                            condition
                        );
                        let mut patched = current.clone();
                        let point = injection_point(&patched);
                        patched.insert_str(point, &join_clause);
                        if point + join_clause.len() < patched.len()
                            && !patched[point + join_clause.len()..].starts_with(' ')
                        {
                            patched.insert(point + join_clause.len(), ' ');
                        }
                        let fixed = format!("{}({}.{})", &caps[1], owner_short, column);
                        out = patched.replacen(&caps[0], &fixed, 1);
                        changed = true;
                        joined = true;
                        break;
                    }
                }
                if joined {
                    break;
                }
            }
            if changed {
                break;
            }
        }

        if !changed {
            break;
        }
    }
    out
}

/// Stage 16: every required mapping column whose table is absent from the
/// query gets a LEFT JOIN along a foreign key from a table already present.
pub fn add_mapping_joins(ctx: &RepairContext, sql: &str) -> String {
    let mut out = sql.to_string();

    for MappingColumn { table, .. } in &ctx.required_columns {
        let alias_map = AliasMap::parse(&out);
        let Some(map_table) = ctx.snapshot.table(table) else { continue };
        let short = map_table.short_name().to_string();
        if alias_map.alias_for_table(&short).is_some() {
            continue;
        }

        for (q_alias, q_table) in alias_map.iter() {
            let q_short = unquote(q_table.rsplit('.').next().unwrap_or(q_table));
            if let Some((fk_owner, fk)) = ctx.fk_between(&short, q_short) {
                let owner_is_new = fk_owner.matches_name(&short);
                let condition = if owner_is_new {
                    format!("{}.{} = {}.{}", short, fk.local_column, q_alias, fk.referenced_column)
                } else {
                    format!("{}.{} = {}.{}", q_alias, fk.local_column, short, fk.referenced_column)
                };
                let join_clause = format!(
                    " LEFT JOIN {} ON {}",
                    ctx.quote_table(&map_table.qualified_name),
                    condition
                );
                let point = injection_point(&out);
                out.insert_str(point, &join_clause);
                if point + join_clause.len() < out.len()
                    && !out[point + join_clause.len()..].starts_with(' ')
                {
                    out.insert(point + join_clause.len(), ' ');
                }
                break;
            }
        }
    }
    out
}
