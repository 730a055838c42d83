// SPDX-License-Identifier: Apache-2.0

//! Identifier-shape repairs: database prefixes, cross-database references,
//! and concatenated `schema_table` forms.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use super::context::{unquote, RepairContext, SEG};

fn three_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"({seg})\.({seg})\.({seg})", seg = SEG)).unwrap()
    })
}

fn two_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Negative context is handled in code; the regex just finds pairs
        // that are not part of a longer dotted chain.
        Regex::new(&format!(r"({seg})\.({seg})(?P<tail>\.?)", seg = SEG)).unwrap()
    })
}

/// Best local rendering of a dotted reference once its database prefix is
/// gone: `schema.table` when that form is in the snapshot, then
/// `table.column`, then the bare table.
fn localize(ctx: &RepairContext, second: &str, third: &str) -> Option<String> {
    let qualified = format!("{}.{}", unquote(second), unquote(third));
    if let Some(table) = ctx.snapshot.table(&qualified) {
        return Some(ctx.quote_table(&table.qualified_name));
    }
    if let Some(table) = ctx.snapshot.table(unquote(second)) {
        if table.has_column(unquote(third)) {
            return Some(format!("{}.{}", second, third));
        }
    }
    if let Some(table) = ctx.snapshot.table(unquote(third)) {
        return Some(ctx.quote_table(&table.qualified_name));
    }
    None
}

/// Stage 2: drop `db.` prefixes that name this very database, shortening to
/// the longest form the snapshot actually contains.
pub fn strip_own_db_prefix(ctx: &RepairContext, sql: &str) -> String {
    let three = three_part_re().replace_all(sql, |caps: &Captures| {
        let (first, second, third) = (&caps[1], &caps[2], &caps[3]);
        if ctx.is_own_name(first) {
            if let Some(local) = localize(ctx, second, third) {
                return local;
            }
        }
        caps[0].to_string()
    });

    let result = two_part_re().replace_all(&three, |caps: &Captures| {
        if !caps["tail"].is_empty() {
            // Part of a longer chain; the three-part pass owns it.
            return caps[0].to_string();
        }
        let (first, second) = (&caps[1], &caps[2]);
        if ctx.is_own_name(first) && ctx.snapshot.table(&format!("{}.{}", unquote(first), unquote(second))).is_none() {
            if let Some(table) = ctx.snapshot.table(unquote(second)) {
                return ctx.quote_table(&table.qualified_name);
            }
        }
        caps[0].to_string()
    });
    result.into_owned()
}

/// Stage 3: identifiers that name a *different* database are rewritten to
/// the closest local table (longest-suffix match on the last segment), or
/// elided when nothing matches.
pub fn repair_cross_db_refs(ctx: &RepairContext, sql: &str) -> String {
    let three = three_part_re().replace_all(sql, |caps: &Captures| {
        let first = &caps[1];
        if ctx.is_other_db_name(first) {
            let last = &caps[3];
            if let Some(local) = localize(ctx, &caps[2], last) {
                return local;
            }
            if let Some(table) = ctx.closest_table(last) {
                return ctx.quote_table(&table.qualified_name);
            }
            return String::new();
        }
        caps[0].to_string()
    });

    let result = two_part_re().replace_all(&three, |caps: &Captures| {
        if !caps["tail"].is_empty() {
            return caps[0].to_string();
        }
        let (first, second) = (&caps[1], &caps[2]);
        if ctx.is_other_db_name(first) {
            if let Some(table) = ctx.closest_table(second) {
                return ctx.quote_table(&table.qualified_name);
            }
            return String::new();
        }
        caps[0].to_string()
    });
    result.into_owned()
}

/// Stage 9: `schema_table.column` written with an underscore where a dot
/// belongs. Split the left side and requalify when the split resolves.
pub fn repair_concatenated_identifiers(ctx: &RepairContext, sql: &str) -> String {
    let result = two_part_re().replace_all(sql, |caps: &Captures| {
        if !caps["tail"].is_empty() {
            return caps[0].to_string();
        }
        let (left, right) = (&caps[1], &caps[2]);
        let left_bare = unquote(left);

        // Already meaningful: a table, an own/other database name, or a
        // plausible alias (single short word without underscores).
        if ctx.snapshot.has_table(left_bare)
            || ctx.is_own_name(left)
            || ctx.is_other_db_name(left)
            || !left_bare.contains('_')
        {
            return caps[0].to_string();
        }

        for (split_at, _) in left_bare.match_indices('_') {
            let (head, tail) = (&left_bare[..split_at], &left_bare[split_at + 1..]);
            let qualified = format!("{}.{}", head, tail);
            if let Some(table) = ctx.snapshot.table(&qualified) {
                if table.has_column(unquote(right)) {
                    return format!("{}.{}", ctx.quote_table(&table.qualified_name), &caps[2]);
                }
            }
            // `dbname_table` concatenations collapse to the table.
            if ctx.own_names.iter().any(|n| n.eq_ignore_ascii_case(head)) {
                if let Some(table) = ctx.snapshot.table(tail) {
                    if table.has_column(unquote(right)) {
                        return format!("{}.{}", ctx.quote_table(&table.qualified_name), &caps[2]);
                    }
                }
            }
        }
        caps[0].to_string()
    });
    result.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::repair::testutil::{ctx, shop_snapshot};

    #[test]
    fn own_three_part_prefix_is_stripped() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT * FROM shop.main.orders";
        assert_eq!(strip_own_db_prefix(&ctx, sql), "SELECT * FROM orders");
    }

    #[test]
    fn own_db_table_column_keeps_column() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT shop.orders.total FROM orders";
        assert_eq!(strip_own_db_prefix(&ctx, sql), "SELECT orders.total FROM orders");
    }

    #[test]
    fn own_two_part_prefix_is_stripped() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT * FROM shop.orders";
        assert_eq!(strip_own_db_prefix(&ctx, sql), "SELECT * FROM orders");
    }

    #[test]
    fn foreign_prefixes_are_left_for_stage_three() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT * FROM crm.main.customers";
        assert_eq!(strip_own_db_prefix(&ctx, sql), sql);
    }

    #[test]
    fn cross_db_ref_resolves_to_closest_table() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT * FROM crm.all_customers";
        assert_eq!(repair_cross_db_refs(&ctx, sql), "SELECT * FROM customers");
    }

    #[test]
    fn cross_db_ref_without_match_is_elided() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT 1 FROM orders WHERE crm.widgets IS NOT NULL";
        let out = repair_cross_db_refs(&ctx, sql);
        assert!(!out.contains("crm"));
        assert!(!out.contains("widgets"));
    }

    #[test]
    fn concatenated_schema_table_splits() {
        let snapshot = crate::generator::repair::testutil::warehouse_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT sales_invoices.amount FROM sales.invoices";
        assert_eq!(
            repair_concatenated_identifiers(&ctx, sql),
            "SELECT \"sales\".\"invoices\".amount FROM sales.invoices"
        );
    }

    #[test]
    fn stages_are_idempotent() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        for sql in [
            "SELECT * FROM shop.main.orders",
            "SELECT * FROM crm.all_customers",
            "SELECT shop.orders.total FROM orders",
        ] {
            let once = strip_own_db_prefix(&ctx, sql);
            assert_eq!(strip_own_db_prefix(&ctx, &once), once);
            let once = repair_cross_db_refs(&ctx, sql);
            assert_eq!(repair_cross_db_refs(&ctx, &once), once);
        }
    }
}
