// SPDX-License-Identifier: Apache-2.0

//! Cross-database orchestration.
//!
//! Independent sub-plans fan out in parallel. When a configured mapping
//! links two databases in the plan, execution switches to priority mode:
//! strictly sequential, ordered by sub-plan priority, with values harvested
//! from each source result injected into downstream queries.

pub mod values;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CrossMapping, DatabaseDescriptor};
use crate::engine::executor::SubPlanExecutor;
use crate::engine::types::{AggregateResult, DbResult, SubPlanState};
use crate::intent::{DbSubPlan, IntentPlan};

pub struct Orchestrator {
    executor: Arc<dyn SubPlanExecutor>,
    mappings: Vec<CrossMapping>,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn SubPlanExecutor>, mappings: Vec<CrossMapping>) -> Self {
        Self { executor, mappings }
    }

    /// A mapping dependency exists when some configured mapping has both of
    /// its endpoint databases in the plan and there is more than one
    /// sub-plan.
    pub fn has_mapping_dependency(&self, plan: &IntentPlan) -> bool {
        if plan.sub_plans.len() < 2 {
            return false;
        }
        let ids: Vec<&str> = plan.sub_plans.iter().map(|s| s.db_id.as_str()).collect();
        self.mappings.iter().any(|m| m.is_active(&ids))
    }

    pub async fn execute(
        &self,
        plan: &IntentPlan,
        descriptors: &HashMap<String, Arc<DatabaseDescriptor>>,
        cancel: &CancellationToken,
    ) -> AggregateResult {
        let started = Instant::now();

        let mut result = if self.has_mapping_dependency(plan) {
            info!("executing in priority mode (mapping dependency present)");
            self.execute_priority(plan, descriptors, cancel).await
        } else {
            info!("executing in parallel mode");
            self.execute_parallel(plan, descriptors, cancel).await
        };

        if cancel.is_cancelled() && !result.errors.iter().any(|e| e.contains("cancelled")) {
            result.ok = false;
            result.errors.push("Operation cancelled".to_string());
        }
        result.elapsed_millis = started.elapsed().as_millis() as u64;
        result
    }

    fn generation_failure(sub: &DbSubPlan) -> DbResult {
        DbResult::failure(
            &sub.db_id,
            &sub.display_name,
            "",
            "SQL generation failed for this database",
            0,
        )
    }

    fn missing_descriptor(sub: &DbSubPlan) -> DbResult {
        DbResult::failure(
            &sub.db_id,
            &sub.display_name,
            sub.generated_sql.as_deref().unwrap_or(""),
            "No configured database matches this sub-plan",
            0,
        )
    }

    /// Fan out one task per sub-plan and join them all. No ordering is
    /// promised; each sub-plan owns its outcome.
    async fn execute_parallel(
        &self,
        plan: &IntentPlan,
        descriptors: &HashMap<String, Arc<DatabaseDescriptor>>,
        cancel: &CancellationToken,
    ) -> AggregateResult {
        let mut aggregate = AggregateResult {
            ok: true,
            ..Default::default()
        };
        let mut tasks: JoinSet<DbResult> = JoinSet::new();

        for sub in &plan.sub_plans {
            let Some(sql) = sub.generated_sql.clone() else {
                record(&mut aggregate, Self::generation_failure(sub));
                continue;
            };
            let Some(descriptor) = descriptors.get(&sub.db_id.to_lowercase()).cloned() else {
                record(&mut aggregate, Self::missing_descriptor(sub));
                continue;
            };

            let executor = self.executor.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                executor.execute(&descriptor, &sql, None, &cancel).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(db_result) => record(&mut aggregate, db_result),
                Err(join_error) => {
                    warn!("sub-plan task failed to join: {}", join_error);
                    aggregate.ok = false;
                    aggregate
                        .errors
                        .push(format!("Database <unknown>: {}", join_error));
                }
            }
        }
        aggregate
    }

    /// Strictly sequential two-phase execution: ascending priority, with
    /// source values injected into later target queries.
    async fn execute_priority(
        &self,
        plan: &IntentPlan,
        descriptors: &HashMap<String, Arc<DatabaseDescriptor>>,
        cancel: &CancellationToken,
    ) -> AggregateResult {
        let mut aggregate = AggregateResult {
            ok: true,
            ..Default::default()
        };

        let mut order: Vec<&DbSubPlan> = plan.sub_plans.iter().collect();
        order.sort_by_key(|s| s.priority);

        // (source_db, source_column) → collected values, both lowercased.
        let mut extracted: HashMap<(String, String), Vec<String>> = HashMap::new();

        for (position, sub) in order.iter().enumerate() {
            if cancel.is_cancelled() {
                aggregate.ok = false;
                break;
            }

            let mut state = SubPlanState::Planned;
            let Some(mut sql) = sub.generated_sql.clone() else {
                record(&mut aggregate, Self::generation_failure(sub));
                break;
            };
            debug_assert!(state.can_advance_to(SubPlanState::Generated));
            state = SubPlanState::Generated;

            let Some(descriptor) = descriptors.get(&sub.db_id.to_lowercase()).cloned() else {
                record(&mut aggregate, Self::missing_descriptor(sub));
                break;
            };

            // Inject values collected from earlier databases.
            if position > 0 && !extracted.is_empty() {
                for mapping in &self.mappings {
                    if !mapping.target_db.eq_ignore_ascii_case(&sub.db_id) {
                        continue;
                    }
                    let key = (
                        mapping.source_db.to_lowercase(),
                        mapping.source_column.to_lowercase(),
                    );
                    let Some(source_values) = extracted.get(&key) else { continue };
                    let (rewritten, changed) =
                        values::inject_values(&sql, &mapping.target_column, source_values);
                    if changed {
                        debug!(
                            db = %sub.db_id,
                            column = %mapping.target_column,
                            count = source_values.len(),
                            "injected mapped values"
                        );
                        sql = rewritten;
                        debug_assert!(state.can_advance_to(SubPlanState::Injected));
                        state = SubPlanState::Injected;
                    }
                }
            }

            debug_assert!(state.can_advance_to(SubPlanState::Executing));
            state = SubPlanState::Executing;
            let db_result = self.executor.execute(&descriptor, &sql, None, cancel).await;
            let succeeded = db_result.ok;
            debug_assert!(state.can_advance_to(if succeeded {
                SubPlanState::Done
            } else {
                SubPlanState::Failed
            }));

            if succeeded {
                // Harvest values for mappings sourced from this database.
                for mapping in &self.mappings {
                    if !mapping.source_db.eq_ignore_ascii_case(&sub.db_id) {
                        continue;
                    }
                    let collected =
                        values::extract_column_values(&db_result.body, &mapping.source_column);
                    debug!(
                        db = %sub.db_id,
                        column = %mapping.source_column,
                        count = collected.len(),
                        "extracted mapped values"
                    );
                    extracted.insert(
                        (
                            mapping.source_db.to_lowercase(),
                            mapping.source_column.to_lowercase(),
                        ),
                        collected,
                    );
                }
            }

            record(&mut aggregate, db_result);
            if !succeeded {
                break;
            }
        }
        aggregate
    }
}

fn record(aggregate: &mut AggregateResult, db_result: DbResult) {
    if !db_result.ok {
        aggregate.ok = false;
        aggregate.errors.push(format!(
            "Database {}: {}",
            db_result.db_id,
            db_result.error.as_deref().unwrap_or("unknown error")
        ));
    }
    aggregate.per_db.insert(db_result.db_id.clone(), db_result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::engine::types::ROWS_EXTRACTED_PREFIX;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records execution order and serves scripted bodies.
    struct RecordingExecutor {
        calls: Mutex<Vec<(String, String)>>,
        bodies: HashMap<String, String>,
        delay_ms: HashMap<String, u64>,
    }

    impl RecordingExecutor {
        fn new(bodies: Vec<(&str, &str)>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                bodies: bodies
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                delay_ms: HashMap::new(),
            }
        }

        fn call_order(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(db, _)| db.clone()).collect()
        }

        fn sql_for(&self, db: &str) -> Option<String> {
            self.calls
                .lock()
                .iter()
                .find(|(d, _)| d == db)
                .map(|(_, sql)| sql.clone())
        }
    }

    #[async_trait]
    impl SubPlanExecutor for RecordingExecutor {
        async fn execute(
            &self,
            descriptor: &DatabaseDescriptor,
            sql: &str,
            _requested_cap: Option<u32>,
            _cancel: &CancellationToken,
        ) -> DbResult {
            if let Some(delay) = self.delay_ms.get(&descriptor.id) {
                tokio::time::sleep(std::time::Duration::from_millis(*delay)).await;
            }
            self.calls
                .lock()
                .push((descriptor.id.clone(), sql.to_string()));
            let body = self
                .bodies
                .get(&descriptor.id)
                .cloned()
                .unwrap_or_else(|| format!("id\n{} 0\n", ROWS_EXTRACTED_PREFIX));
            let rows = body.lines().count().saturating_sub(2) as u32;
            DbResult {
                db_id: descriptor.id.clone(),
                display_name: descriptor.display_name.clone(),
                executed_sql: sql.to_string(),
                rows_extracted: rows,
                body,
                ok: true,
                error: None,
                elapsed_millis: 1,
            }
        }
    }

    fn descriptor(id: &str) -> Arc<DatabaseDescriptor> {
        Arc::new(
            DatabaseDescriptor::from_settings(DatabaseSettings {
                name: Some(id.to_string()),
                dialect: "sqlite".to_string(),
                connection_string: ":memory:".to_string(),
                max_rows_per_query: 100,
                included_tables: vec![],
                excluded_tables: vec![],
                sensitive_columns: vec![],
                query_timeout_seconds: 30,
                cross_database_mappings: vec![],
            })
            .unwrap(),
        )
    }

    fn descriptor_map(ids: &[&str]) -> HashMap<String, Arc<DatabaseDescriptor>> {
        ids.iter()
            .map(|id| (id.to_lowercase(), descriptor(id)))
            .collect()
    }

    fn sub_plan(db: &str, priority: i32, sql: Option<&str>) -> DbSubPlan {
        DbSubPlan {
            db_id: db.to_string(),
            display_name: db.to_string(),
            required_tables: vec![],
            purpose: String::new(),
            priority,
            generated_sql: sql.map(str::to_string),
        }
    }

    fn plan(subs: Vec<DbSubPlan>) -> IntentPlan {
        IntentPlan {
            original_question: "q".to_string(),
            understanding: String::new(),
            confidence: 1.0,
            reasoning: String::new(),
            requires_cross_db_join: false,
            sub_plans: subs,
        }
    }

    fn mapping() -> CrossMapping {
        CrossMapping {
            source_db: "A".to_string(),
            source_table: "customers".to_string(),
            source_column: "id".to_string(),
            target_db: "B".to_string(),
            target_table: "orders".to_string(),
            target_column: "customer_id".to_string(),
        }
    }

    #[tokio::test]
    async fn parallel_mode_runs_everything_and_aggregates() {
        let executor = Arc::new(RecordingExecutor::new(vec![
            ("A", "x\n1\nRows extracted: 1\n"),
            ("B", "y\n2\nRows extracted: 1\n"),
        ]));
        let orchestrator = Orchestrator::new(executor.clone(), vec![]);
        let plan = plan(vec![
            sub_plan("A", 1, Some("SELECT x FROM t")),
            sub_plan("B", 1, Some("SELECT y FROM u")),
        ]);

        let result = orchestrator
            .execute(&plan, &descriptor_map(&["A", "B"]), &CancellationToken::new())
            .await;

        assert!(result.ok);
        assert_eq!(result.per_db.len(), 2);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn generation_failure_fails_aggregate_but_others_run() {
        let executor = Arc::new(RecordingExecutor::new(vec![]));
        let orchestrator = Orchestrator::new(executor.clone(), vec![]);
        let plan = plan(vec![
            sub_plan("A", 1, Some("SELECT 1")),
            sub_plan("B", 1, None),
        ]);

        let result = orchestrator
            .execute(&plan, &descriptor_map(&["A", "B"]), &CancellationToken::new())
            .await;

        assert!(!result.ok);
        assert_eq!(result.per_db.len(), 2);
        assert_eq!(executor.call_order(), vec!["A".to_string()]);
        assert!(result.errors[0].starts_with("Database B:"));
    }

    #[tokio::test]
    async fn mapping_dependency_selects_priority_mode_and_orders_execution() {
        let executor = Arc::new(RecordingExecutor::new(vec![
            ("A", "id\tname\n1\tAda\n2\tGrace\n3\tEve\nRows extracted: 3\n"),
            ("B", "order_id\nRows extracted: 0\n"),
        ]));
        let orchestrator = Orchestrator::new(executor.clone(), vec![mapping()]);
        // Declared out of order; priority must win.
        let plan = plan(vec![
            sub_plan("B", 2, Some("SELECT order_id FROM orders WHERE customer_id IN (0)")),
            sub_plan("A", 1, Some("SELECT id, name FROM customers")),
        ]);

        let result = orchestrator
            .execute(&plan, &descriptor_map(&["A", "B"]), &CancellationToken::new())
            .await;

        assert!(result.ok);
        assert_eq!(executor.call_order(), vec!["A".to_string(), "B".to_string()]);
        // Values from A were injected into B's IN list.
        assert_eq!(
            executor.sql_for("B").unwrap(),
            "SELECT order_id FROM orders WHERE customer_id IN (1, 2, 3)"
        );
    }

    #[tokio::test]
    async fn empty_source_injects_false_predicate() {
        let executor = Arc::new(RecordingExecutor::new(vec![
            ("A", "id\nRows extracted: 0\n"),
            ("B", "order_id\nRows extracted: 0\n"),
        ]));
        let orchestrator = Orchestrator::new(executor.clone(), vec![mapping()]);
        let plan = plan(vec![
            sub_plan("A", 1, Some("SELECT id FROM customers")),
            sub_plan("B", 2, Some("SELECT order_id FROM orders WHERE customer_id IN (0)")),
        ]);

        let result = orchestrator
            .execute(&plan, &descriptor_map(&["A", "B"]), &CancellationToken::new())
            .await;

        assert!(result.ok);
        assert_eq!(
            executor.sql_for("B").unwrap(),
            "SELECT order_id FROM orders WHERE 1=0"
        );
    }

    #[tokio::test]
    async fn priority_mode_stops_after_failure() {
        struct FailingExecutor;

        #[async_trait]
        impl SubPlanExecutor for FailingExecutor {
            async fn execute(
                &self,
                descriptor: &DatabaseDescriptor,
                sql: &str,
                _cap: Option<u32>,
                _cancel: &CancellationToken,
            ) -> DbResult {
                DbResult::failure(&descriptor.id, &descriptor.display_name, sql, "boom", 1)
            }
        }

        let orchestrator = Orchestrator::new(Arc::new(FailingExecutor), vec![mapping()]);
        let plan = plan(vec![
            sub_plan("A", 1, Some("SELECT id FROM customers")),
            sub_plan("B", 2, Some("SELECT order_id FROM orders WHERE customer_id IN (0)")),
        ]);

        let result = orchestrator
            .execute(&plan, &descriptor_map(&["A", "B"]), &CancellationToken::new())
            .await;

        assert!(!result.ok);
        // The loop broke before B.
        assert_eq!(result.per_db.len(), 1);
        assert_eq!(result.errors, vec!["Database A: boom".to_string()]);
    }

    #[tokio::test]
    async fn single_sub_plan_never_uses_priority_mode() {
        let executor = Arc::new(RecordingExecutor::new(vec![]));
        let orchestrator = Orchestrator::new(executor.clone(), vec![mapping()]);
        let plan = plan(vec![sub_plan("A", 1, Some("SELECT 1"))]);
        assert!(!orchestrator.has_mapping_dependency(&plan));
    }

    #[tokio::test]
    async fn cancellation_is_marked_in_errors() {
        let executor = Arc::new(RecordingExecutor::new(vec![]));
        let orchestrator = Orchestrator::new(executor, vec![mapping()]);
        let plan = plan(vec![
            sub_plan("A", 1, Some("SELECT 1")),
            sub_plan("B", 2, Some("SELECT 2")),
        ]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator
            .execute(&plan, &descriptor_map(&["A", "B"]), &cancel)
            .await;

        assert!(!result.ok);
        assert!(result.errors.iter().any(|e| e.contains("cancelled")));
    }
}
