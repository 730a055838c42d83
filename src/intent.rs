// SPDX-License-Identifier: Apache-2.0

//! Intent analysis: question + snapshots → routing plan.
//!
//! The LLM proposes which databases and tables matter; everything it says is
//! validated against the snapshots and closed over foreign keys so the SQL
//! generator only ever sees joinable table sets.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::SchemaSnapshot;
use crate::engine::error::EngineResult;
use crate::llm::LlmClient;

/// Tables taken per snapshot when the model response is unusable.
const FALLBACK_TABLE_COUNT: usize = 5;
const FALLBACK_CONFIDENCE: f64 = 0.3;

/// Rendering caps so a large fleet cannot blow the prompt.
const MAX_RENDER_TABLES: usize = 30;
const MAX_RENDER_WORDS: usize = 4000;
const MAX_RENDER_COLUMNS: usize = 12;

/// The per-database portion of an intent plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSubPlan {
    pub db_id: String,
    pub display_name: String,
    pub required_tables: Vec<String>,
    pub purpose: String,
    pub priority: i32,
    /// Populated by the SQL generator; `None` until generation succeeds.
    pub generated_sql: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentPlan {
    pub original_question: String,
    pub understanding: String,
    pub confidence: f64,
    pub reasoning: String,
    /// Advisory only: the orchestrator derives its mode from configured
    /// mappings, never from this flag.
    pub requires_cross_db_join: bool,
    pub sub_plans: Vec<DbSubPlan>,
}

// Wire shape of the strict-JSON response the prompt demands.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireIntent {
    #[serde(default)]
    understanding: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    requires_cross_database_join: bool,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    databases: Vec<WireDatabase>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDatabase {
    database_id: String,
    #[serde(default)]
    database_name: String,
    #[serde(default)]
    required_tables: Vec<String>,
    #[serde(default)]
    purpose: String,
    #[serde(default = "default_priority")]
    priority: i32,
}

fn default_priority() -> i32 {
    1
}

pub struct IntentAnalyzer {
    llm: Arc<dyn LlmClient>,
}

impl IntentAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Build a validated routing plan for the question.
    pub async fn analyze(
        &self,
        question: &str,
        snapshots: &[Arc<SchemaSnapshot>],
        cancel: &CancellationToken,
    ) -> EngineResult<IntentPlan> {
        let context: Vec<String> = snapshots
            .iter()
            .map(|s| render_snapshot(s, question))
            .collect();
        let prompt = build_prompt(question);

        let response = self.llm.generate(&prompt, &context, cancel).await;

        let mut plan = match response {
            Ok(text) => match parse_intent_response(question, &text) {
                Some(plan) => plan,
                None => {
                    warn!("intent response unparseable; using fallback plan");
                    fallback_plan(question, snapshots)
                }
            },
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                warn!("intent request failed ({}); using fallback plan", err);
                fallback_plan(question, snapshots)
            }
        };

        validate_plan(&mut plan, snapshots);
        debug!(
            databases = plan.sub_plans.len(),
            confidence = plan.confidence,
            "intent plan ready"
        );
        Ok(plan)
    }
}

fn build_prompt(question: &str) -> String {
    format!(
        "You are the routing planner of a multi-database question-answering \
         system. The system context lists every reachable database with its \
         tables, columns, and foreign keys.\n\
         Decide which databases and tables must be consulted to answer the \
         question. Databases whose data is needed earliest (because other \
         databases depend on their values) get the lowest priority number.\n\
         Respond with STRICT JSON only, no prose, matching exactly:\n\
         {{\"understanding\": \"...\", \"confidence\": 0.0, \
         \"requiresCrossDatabaseJoin\": false, \"reasoning\": \"...\", \
         \"databases\": [{{\"databaseId\": \"...\", \"databaseName\": \"...\", \
         \"requiredTables\": [\"...\"], \"purpose\": \"...\", \"priority\": 1}}]}}\n\n\
         Question: {}",
        question
    )
}

/// Compact, word-capped rendering of one snapshot. Tables mentioned in the
/// question sort first so truncation never hides the obviously relevant ones.
pub fn render_snapshot(snapshot: &SchemaSnapshot, question: &str) -> String {
    let question_lower = question.to_lowercase();

    let mut tables: Vec<_> = snapshot.tables.iter().collect();
    tables.sort_by(|a, b| {
        let a_mentioned = question_lower.contains(&a.short_name().to_lowercase());
        let b_mentioned = question_lower.contains(&b.short_name().to_lowercase());
        b_mentioned.cmp(&a_mentioned)
    });

    let mut out = format!(
        "DATABASE: {} (dialect: {})\nTABLES:\n",
        snapshot.db_id,
        snapshot.dialect.display_name()
    );
    let mut words = 0usize;

    for table in tables.into_iter().take(MAX_RENDER_TABLES) {
        if words > MAX_RENDER_WORDS {
            out.push_str("… (truncated)\n");
            break;
        }
        let cols: Vec<&str> = table
            .columns
            .iter()
            .take(MAX_RENDER_COLUMNS)
            .map(|c| c.name.as_str())
            .collect();
        let line = format!(
            "- {}({}) [~{} rows]\n",
            table.qualified_name,
            cols.join(", "),
            table.approx_row_count
        );
        words += line.split_whitespace().count();
        out.push_str(&line);

        for fk in &table.foreign_keys {
            let fk_line = format!(
                "  FK {}.{} -> {}.{}\n",
                table.short_name(),
                fk.local_column,
                fk.referenced_table,
                fk.referenced_column
            );
            words += fk_line.split_whitespace().count();
            out.push_str(&fk_line);
        }
    }
    out
}

/// Locate and parse the strict-JSON object in the response text.
fn parse_intent_response(question: &str, text: &str) -> Option<IntentPlan> {
    let json = extract_json_object(text)?;
    let wire: WireIntent = serde_json::from_str(&json).ok()?;
    if wire.databases.is_empty() {
        return None;
    }

    Some(IntentPlan {
        original_question: question.to_string(),
        understanding: wire.understanding,
        confidence: wire.confidence.clamp(0.0, 1.0),
        reasoning: wire.reasoning,
        requires_cross_db_join: wire.requires_cross_database_join,
        sub_plans: wire
            .databases
            .into_iter()
            .map(|db| DbSubPlan {
                display_name: if db.database_name.is_empty() {
                    db.database_id.clone()
                } else {
                    db.database_name
                },
                db_id: db.database_id,
                required_tables: db.required_tables,
                purpose: db.purpose,
                priority: db.priority,
                generated_sql: None,
            })
            .collect(),
    })
}

/// First balanced `{ … }` block, tolerating fences and surrounding prose.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// One sub-plan per snapshot with its first few tables.
fn fallback_plan(question: &str, snapshots: &[Arc<SchemaSnapshot>]) -> IntentPlan {
    IntentPlan {
        original_question: question.to_string(),
        understanding: question.to_string(),
        confidence: FALLBACK_CONFIDENCE,
        reasoning: "Model response was unusable; consulting every database".to_string(),
        requires_cross_db_join: snapshots.len() > 1,
        sub_plans: snapshots
            .iter()
            .map(|snapshot| DbSubPlan {
                db_id: snapshot.db_id.clone(),
                display_name: snapshot.display_name.clone(),
                required_tables: snapshot
                    .tables
                    .iter()
                    .take(FALLBACK_TABLE_COUNT)
                    .map(|t| t.qualified_name.clone())
                    .collect(),
                purpose: "Retrieve relevant data".to_string(),
                priority: 1,
                generated_sql: None,
            })
            .collect(),
    }
}

/// Drop unknown databases and tables, canonicalise the survivors, then close
/// each table set over the snapshot's foreign keys so every referenced table
/// that exists in the same snapshot is included.
pub fn validate_plan(plan: &mut IntentPlan, snapshots: &[Arc<SchemaSnapshot>]) {
    plan.sub_plans.retain_mut(|sub| {
        let Some(snapshot) = snapshots
            .iter()
            .find(|s| s.db_id.eq_ignore_ascii_case(&sub.db_id))
        else {
            warn!(db = %sub.db_id, "intent referenced unknown database; dropped");
            return false;
        };
        sub.db_id = snapshot.db_id.clone();
        sub.display_name = snapshot.display_name.clone();

        let mut resolved: Vec<String> = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for name in &sub.required_tables {
            if let Some(table) = snapshot.table(name) {
                if !resolved.iter().any(|t| t.eq_ignore_ascii_case(&table.qualified_name)) {
                    resolved.push(table.qualified_name.clone());
                    queue.push_back(table.qualified_name.clone());
                }
            } else {
                warn!(db = %sub.db_id, table = %name, "intent referenced unknown table; dropped");
            }
        }

        // Breadth-first closure along foreign keys.
        while let Some(current) = queue.pop_front() {
            let Some(table) = snapshot.table(&current) else { continue };
            for fk in &table.foreign_keys {
                if let Some(referent) = snapshot.table(&fk.referenced_table) {
                    if !resolved
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(&referent.qualified_name))
                    {
                        resolved.push(referent.qualified_name.clone());
                        queue.push_back(referent.qualified_name.clone());
                    }
                }
            }
        }

        sub.required_tables = resolved;
        true
    });
}
