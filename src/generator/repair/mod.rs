// SPDX-License-Identifier: Apache-2.0

//! The repair cascade.
//!
//! Model-produced SQL passes through an ordered list of named, pure,
//! idempotent rewrites, each grounded in the schema snapshot, followed by a
//! final validator. A statement the cascade cannot make valid fails its
//! sub-plan; nothing invalid reaches a database.

pub mod clauses;
pub mod columns;
pub mod context;
pub mod identifiers;
pub mod joins;
pub mod mappings;
pub mod validate;

#[cfg(test)]
pub mod testutil;

pub use context::{MappingColumn, RepairContext};

use tracing::debug;

use crate::engine::error::EngineResult;

/// A single rewrite: pure and total over the statement text.
pub type StageFn = fn(&RepairContext, &str) -> String;

fn normalize(ctx: &RepairContext, sql: &str) -> String {
    ctx.dialect.format_sql(sql)
}

/// The ordered cascade. Names show up in debug traces.
pub const STAGES: &[(&str, StageFn)] = &[
    ("normalize", normalize),
    ("strip-own-db-prefix", identifiers::strip_own_db_prefix),
    ("repair-cross-db-refs", identifiers::repair_cross_db_refs),
    ("remove-invalid-subqueries", joins::remove_invalid_subqueries),
    ("remove-invalid-joins", joins::remove_invalid_joins),
    ("repair-undefined-aliases", columns::repair_undefined_alias_refs),
    ("fix-empty-select", columns::fix_empty_select),
    ("substitute-source-column", mappings::substitute_source_column),
    ("repair-concatenated-identifiers", identifiers::repair_concatenated_identifiers),
    ("column-used-as-function", columns::repair_column_used_as_function),
    ("replace-invalid-columns", columns::replace_invalid_columns),
    ("repair-aggregate-args", joins::repair_aggregate_args),
    ("group-by-closure", clauses::group_by_closure),
    ("remove-invalid-columns", columns::remove_invalid_columns),
    ("repair-order-by", clauses::repair_order_by),
    ("add-mapping-joins", joins::add_mapping_joins),
    ("inject-mapping-columns", mappings::inject_mapping_columns),
    ("inject-descriptive-columns", mappings::inject_descriptive_columns),
    ("disambiguate-columns", columns::disambiguate_columns),
    ("dialect-post-pass", columns::dialect_post_pass),
];

/// Run every stage in order, then validate. Returns the repaired statement
/// or the validation error.
pub fn run_cascade(ctx: &RepairContext, sql: &str) -> EngineResult<String> {
    let mut current = sql.to_string();
    for (name, stage) in STAGES {
        let next = stage(ctx, &current);
        if next != current {
            debug!(stage = name, "rewrite applied");
            current = next;
        }
    }
    validate::validate(ctx, &current)?;
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::repair::testutil::{ctx, ctx_with_mappings, shop_snapshot};

    #[test]
    fn cascade_passes_clean_sql_through() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "SELECT o.id, o.total FROM orders o ORDER BY o.total DESC LIMIT 3";
        assert_eq!(run_cascade(&ctx, sql).unwrap(), sql);
    }

    #[test]
    fn cascade_repairs_misbound_alias_end_to_end() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        // The model asked orders for a column only customers own.
        let sql = "SELECT o.name FROM orders o JOIN customers p ON o.customer_id = p.id";
        let out = run_cascade(&ctx, sql).unwrap();
        assert!(out.contains("p.name"), "got: {}", out);
        assert!(!out.contains("o.name"), "got: {}", out);
    }

    #[test]
    fn cascade_strips_fences_and_prefixes() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "```sql\nSELECT shop.orders.total FROM shop.orders;\n```";
        let out = run_cascade(&ctx, sql).unwrap();
        assert_eq!(out, "SELECT orders.total FROM orders");
    }

    #[test]
    fn cascade_leaves_cte_statements_intact() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        let sql = "WITH big AS (SELECT customer_id, SUM(total) AS t FROM orders GROUP BY customer_id) SELECT customer_id, t FROM big ORDER BY t DESC";
        assert_eq!(run_cascade(&ctx, sql).unwrap(), sql);
    }

    #[test]
    fn cascade_fails_on_unrepairable_statement() {
        let snapshot = shop_snapshot();
        let ctx = ctx(&snapshot);
        assert!(run_cascade(&ctx, "SELECT * FROM total_mystery_table").is_err());
    }

    #[test]
    fn cascade_is_idempotent() {
        let snapshot = shop_snapshot();
        let ctx = ctx_with_mappings(
            &snapshot,
            vec![MappingColumn {
                table: "orders".to_string(),
                column: "customer_id".to_string(),
            }],
            vec![],
        );
        let inputs = [
            "SELECT o.name FROM orders o JOIN customers p ON o.customer_id = p.id",
            "SELECT SUM(o.total) FROM orders o",
            "SELECT o.id FROM orders o WHERE o.customer_id IN (SELECT id FROM phantoms)",
            "SELECT id, total FROM orders ORDER BY mystery DESC",
        ];
        for sql in inputs {
            let once = match run_cascade(&ctx, sql) {
                Ok(out) => out,
                Err(_) => continue,
            };
            let twice = run_cascade(&ctx, &once).unwrap();
            assert_eq!(once, twice, "cascade not idempotent for: {}", sql);
        }
    }
}
