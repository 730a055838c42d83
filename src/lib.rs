// querymesh - multi-database query planning and execution core
// Core library

pub mod catalog;
pub mod config;
pub mod debug_log;
pub mod docstore;
pub mod engine;
pub mod generator;
pub mod intent;
pub mod llm;
pub mod observability;
pub mod orchestrator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

pub use tokio_util::sync::CancellationToken;

use catalog::{SchemaCatalog, SchemaSnapshot};
use config::{DatabaseDescriptor, MeshConfig};
use debug_log::{DebugSink, NoopSink};
use docstore::DocumentStore;
use engine::error::{EngineError, EngineResult};
use engine::executor::{QueryExecutor, SubPlanExecutor};
use engine::types::AggregateResult;
use generator::SqlGenerator;
use intent::IntentAnalyzer;
use llm::LlmClient;
use orchestrator::Orchestrator;

/// The assembled query-planning core: one immutable construction graph,
/// shared by reference, owning no back-pointers.
pub struct QueryMesh {
    descriptors: Vec<Arc<DatabaseDescriptor>>,
    descriptor_index: HashMap<String, Arc<DatabaseDescriptor>>,
    catalog: Arc<SchemaCatalog>,
    intent: IntentAnalyzer,
    generator: SqlGenerator,
    orchestrator: Orchestrator,
    plan_deadline: Option<Duration>,
    debug_sink: Arc<dyn DebugSink>,
    mappings: Vec<config::CrossMapping>,
}

impl QueryMesh {
    pub fn new(config: MeshConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self::with_parts(config, llm, Arc::new(QueryExecutor::new()), None)
    }

    /// Full wiring control: custom executor (tests), optional document
    /// store for schema-chunk persistence.
    pub fn with_parts(
        config: MeshConfig,
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn SubPlanExecutor>,
        docstore: Option<Arc<dyn DocumentStore>>,
    ) -> Self {
        let mappings = config.all_mappings();
        let descriptors: Vec<Arc<DatabaseDescriptor>> =
            config.databases.into_iter().map(Arc::new).collect();
        let descriptor_index = descriptors
            .iter()
            .map(|d| (d.id.to_lowercase(), d.clone()))
            .collect();

        Self {
            descriptor_index,
            descriptors,
            catalog: Arc::new(SchemaCatalog::new(docstore)),
            intent: IntentAnalyzer::new(llm.clone()),
            generator: SqlGenerator::new(llm),
            orchestrator: Orchestrator::new(executor, mappings.clone()),
            plan_deadline: config.plan_deadline,
            debug_sink: Arc::new(NoopSink),
            mappings,
        }
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug_sink = sink;
        self
    }

    pub fn descriptors(&self) -> &[Arc<DatabaseDescriptor>] {
        &self.descriptors
    }

    /// Idempotent schema analysis for one descriptor.
    pub async fn analyse_schema(
        &self,
        descriptor: &DatabaseDescriptor,
        cancel: &CancellationToken,
    ) -> EngineResult<Arc<SchemaSnapshot>> {
        self.catalog.snapshot(descriptor, cancel).await
    }

    /// The whole pipeline: snapshots → intent → SQL generation → execution.
    pub async fn plan_and_execute(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> AggregateResult {
        let child = cancel.child_token();
        let watchdog = self.plan_deadline.map(|deadline| {
            let child = child.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                child.cancel();
            })
        });

        let result = self.run_pipeline(question, &child).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        result
    }

    async fn run_pipeline(&self, question: &str, cancel: &CancellationToken) -> AggregateResult {
        info!(question = %question, databases = self.descriptors.len(), "planning query");
        self.debug_sink.append(&format!("question: {}", question));

        // Snapshot every configured database, concurrently; the catalog's
        // single-flight guard deduplicates repeat work.
        let mut tasks = tokio::task::JoinSet::new();
        for descriptor in &self.descriptors {
            let catalog = self.catalog.clone();
            let descriptor = descriptor.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { catalog.snapshot(&descriptor, &cancel).await });
        }

        let mut snapshots: Vec<Arc<SchemaSnapshot>> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(snapshot)) => snapshots.push(snapshot),
                Ok(Err(err)) if err.is_cancelled() => return cancelled_aggregate(),
                Ok(Err(err)) => warn!("schema analysis failed: {}", err),
                Err(join_error) => warn!("schema task failed to join: {}", join_error),
            }
        }
        // Deterministic ordering for prompts and plans.
        snapshots.sort_by(|a, b| a.db_id.cmp(&b.db_id));

        if snapshots.is_empty() {
            return AggregateResult {
                ok: false,
                errors: vec!["No database schema could be analysed".to_string()],
                ..Default::default()
            };
        }

        let mut plan = match self.intent.analyze(question, &snapshots, cancel).await {
            Ok(plan) => plan,
            Err(err) if err.is_cancelled() => return cancelled_aggregate(),
            Err(err) => {
                return AggregateResult {
                    ok: false,
                    errors: vec![format!("Intent analysis failed: {}", err)],
                    ..Default::default()
                }
            }
        };

        if plan.sub_plans.is_empty() {
            return AggregateResult {
                ok: false,
                errors: vec!["No configured database matches the question".to_string()],
                ..Default::default()
            };
        }
        self.debug_sink.append(&format!(
            "intent: {} sub-plan(s), confidence {:.2}",
            plan.sub_plans.len(),
            plan.confidence
        ));

        match self
            .generator
            .generate(&mut plan, &snapshots, &self.mappings, cancel)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => return cancelled_aggregate(),
            Err(err) => {
                // Sub-plans keep generated_sql = None and fail individually.
                warn!("SQL generation failed: {}", err);
                self.debug_sink
                    .append(&format!("generation failed: {}", err));
            }
        }
        for sub in &plan.sub_plans {
            self.debug_sink.append(&format!(
                "sql[{}]: {}",
                sub.db_id,
                sub.generated_sql.as_deref().unwrap_or("<none>")
            ));
        }

        let result = self
            .orchestrator
            .execute(&plan, &self.descriptor_index, cancel)
            .await;
        info!(
            ok = result.ok,
            databases = result.per_db.len(),
            elapsed_ms = result.elapsed_millis,
            "plan finished"
        );
        result
    }
}

fn cancelled_aggregate() -> AggregateResult {
    AggregateResult {
        ok: false,
        errors: vec![EngineError::Cancelled.to_string()],
        ..Default::default()
    }
}
