// SPDX-License-Identifier: Apache-2.0

//! SQL generation.
//!
//! Turns an intent plan into one dialect-specific SQL statement per
//! sub-plan: prompt assembly, response extraction, and the schema-grounded
//! repair cascade. A sub-plan whose statement cannot be made valid keeps
//! `generated_sql = None` and fails on its own; the others continue.

pub mod extract;
pub mod repair;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::SchemaSnapshot;
use crate::config::CrossMapping;
use crate::engine::error::EngineResult;
use crate::intent::IntentPlan;
use crate::llm::LlmClient;
use repair::{MappingColumn, RepairContext};

pub struct SqlGenerator {
    llm: Arc<dyn LlmClient>,
}

impl SqlGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Populate `generated_sql` on every sub-plan the model and the cascade
    /// can serve.
    pub async fn generate(
        &self,
        plan: &mut IntentPlan,
        snapshots: &[Arc<SchemaSnapshot>],
        mappings: &[CrossMapping],
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        if plan.sub_plans.is_empty() {
            return Ok(());
        }

        let required = required_mapping_columns(plan, mappings);

        let mut context = Vec::with_capacity(plan.sub_plans.len());
        for (k, sub) in plan.sub_plans.iter().enumerate() {
            if let Some(snapshot) = snapshot_for(snapshots, &sub.db_id) {
                context.push(render_system_block(k + 1, snapshot, &sub.required_tables));
            }
        }

        let prompt = build_user_prompt(plan, &required);
        let response = self.llm.generate(&prompt, &context, cancel).await?;

        let score_tables: Vec<Vec<String>> = plan
            .sub_plans
            .iter()
            .map(|sub| {
                snapshot_for(snapshots, &sub.db_id)
                    .map(|s| {
                        s.tables
                            .iter()
                            .map(|t| t.short_name().to_string())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        let extracted = extract::extract(&response, plan.sub_plans.len(), &score_tables);

        for (k, sub) in plan.sub_plans.iter_mut().enumerate() {
            let Some(raw) = extracted.get(k).and_then(|e| e.clone()) else {
                warn!(db = %sub.db_id, "no SQL extracted for sub-plan");
                continue;
            };
            let Some(snapshot) = snapshot_for(snapshots, &sub.db_id) else {
                continue;
            };

            let other_names = other_db_names(snapshots, &sub.db_id);
            let db_required = required
                .get(&sub.db_id.to_lowercase())
                .cloned()
                .unwrap_or_default();
            let incoming: Vec<CrossMapping> = mappings
                .iter()
                .filter(|m| m.target_db.eq_ignore_ascii_case(&sub.db_id))
                .cloned()
                .collect();

            let ctx = RepairContext::new(snapshot, other_names, db_required, incoming);
            match repair::run_cascade(&ctx, &raw) {
                Ok(sql) => {
                    debug!(db = %sub.db_id, "generated SQL ready");
                    sub.generated_sql = Some(sql);
                }
                Err(err) => {
                    warn!(db = %sub.db_id, "repair cascade failed: {}", err);
                    sub.generated_sql = None;
                }
            }
        }
        Ok(())
    }
}

fn snapshot_for<'a>(
    snapshots: &'a [Arc<SchemaSnapshot>],
    db_id: &str,
) -> Option<&'a Arc<SchemaSnapshot>> {
    snapshots.iter().find(|s| s.db_id.eq_ignore_ascii_case(db_id))
}

fn other_db_names(snapshots: &[Arc<SchemaSnapshot>], own_id: &str) -> Vec<String> {
    let mut names = Vec::new();
    for snapshot in snapshots {
        if snapshot.db_id.eq_ignore_ascii_case(own_id) {
            continue;
        }
        for name in [
            snapshot.db_id.to_lowercase(),
            snapshot.catalog_name.to_lowercase(),
            snapshot.display_name.to_lowercase(),
        ] {
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// Columns each database must project because a cross mapping active in
/// this plan touches them, keyed by lowercased db id.
pub fn required_mapping_columns(
    plan: &IntentPlan,
    mappings: &[CrossMapping],
) -> HashMap<String, Vec<MappingColumn>> {
    let ids: Vec<&str> = plan.sub_plans.iter().map(|s| s.db_id.as_str()).collect();
    let mut required: HashMap<String, Vec<MappingColumn>> = HashMap::new();

    for mapping in mappings {
        if !mapping.is_active(&ids) {
            continue;
        }
        let source = MappingColumn {
            table: mapping.source_table.clone(),
            column: mapping.source_column.clone(),
        };
        let target = MappingColumn {
            table: mapping.target_table.clone(),
            column: mapping.target_column.clone(),
        };
        let source_entry = required
            .entry(mapping.source_db.to_lowercase())
            .or_default();
        if !source_entry.contains(&source) {
            source_entry.push(source);
        }
        let target_entry = required
            .entry(mapping.target_db.to_lowercase())
            .or_default();
        if !target_entry.contains(&target) {
            target_entry.push(target);
        }
    }
    required
}

/// One system block per database: dialect, quoting rules, schema fragment.
fn render_system_block(
    ordinal: usize,
    snapshot: &SchemaSnapshot,
    required_tables: &[String],
) -> String {
    let mut out = format!(
        "DATABASE {}: {}\nDialect: {} ({}).\nSchema:\n",
        ordinal,
        snapshot.db_id,
        snapshot.dialect.display_name(),
        snapshot.dialect.quoting_hint()
    );

    for name in required_tables {
        let Some(table) = snapshot.table(name) else { continue };
        let cols: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                let mut rendered = format!("{} {}", c.name, c.data_type);
                if c.is_primary_key {
                    rendered.push_str(" PK");
                }
                if !c.nullable {
                    rendered.push_str(" NOT NULL");
                }
                rendered
            })
            .collect();
        out.push_str(&format!("TABLE {} ({})\n", table.qualified_name, cols.join(", ")));
        for fk in &table.foreign_keys {
            out.push_str(&format!(
                "  FOREIGN KEY {} -> {}.{}\n",
                fk.local_column, fk.referenced_table, fk.referenced_column
            ));
        }
    }
    out
}

/// The user block: the question, the wire-format contract, and per-database
/// targets with any mapping-column obligations.
fn build_user_prompt(
    plan: &IntentPlan,
    required: &HashMap<String, Vec<MappingColumn>>,
) -> String {
    let mut out = format!(
        "Question: {}\n\n\
         Write exactly one SQL statement per database listed below.\n\
         For each database, answer in this exact format:\n\
         DATABASE <k>: <name>\n\
         CONFIRMED\n\
         ```sql\n<the statement>\n```\n\
         Only SELECT (or WITH) statements. Use only the tables and columns \
         listed in the system context for that database. Never reference one \
         database from another database's statement.\n\n",
        plan.original_question
    );

    for (k, sub) in plan.sub_plans.iter().enumerate() {
        out.push_str(&format!("DATABASE {}: {}\n", k + 1, sub.db_id));
        if !sub.purpose.is_empty() {
            out.push_str(&format!("Purpose: {}\n", sub.purpose));
        }
        if let Some(columns) = required.get(&sub.db_id.to_lowercase()) {
            let rendered: Vec<String> = columns
                .iter()
                .map(|c| format!("{}.{}", c.table, c.column))
                .collect();
            out.push_str(&format!(
                "MAPPING COLUMNS REQUIRED — MUST include in SELECT and in \
                 GROUP BY if aggregating: {}\n",
                rendered.join(", ")
            ));
        }
        out.push('\n');
    }
    out
}
