// SPDX-License-Identifier: Apache-2.0

//! Result types shared by the executor and the orchestrator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Literal used for SQL NULL in result bodies.
pub const NULL_PLACEHOLDER: &str = "NULL";

/// Literal substituted for values of sensitive columns.
pub const SENSITIVE_PLACEHOLDER: &str = "[SENSITIVE_DATA]";

/// Trailer line prefix that closes every result body.
pub const ROWS_EXTRACTED_PREFIX: &str = "Rows extracted:";

/// Lifecycle of one sub-plan, from planning to its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubPlanState {
    Planned,
    Generated,
    Injected,
    Executing,
    Done,
    Failed,
}

impl SubPlanState {
    /// Legal forward transitions; anything may fail.
    pub fn can_advance_to(self, next: SubPlanState) -> bool {
        use SubPlanState::*;
        match (self, next) {
            (_, Failed) => true,
            (Planned, Generated) => true,
            (Generated, Injected) | (Generated, Executing) => true,
            (Injected, Executing) => true,
            (Executing, Done) => true,
            _ => false,
        }
    }
}

/// Outcome of executing one sub-plan against its database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbResult {
    pub db_id: String,
    pub display_name: String,
    pub executed_sql: String,
    pub rows_extracted: u32,
    /// Tab-delimited block headed by a column-name row and terminated by a
    /// `Rows extracted: N` line.
    pub body: String,
    pub ok: bool,
    pub error: Option<String>,
    pub elapsed_millis: u64,
}

impl DbResult {
    pub fn failure(
        db_id: impl Into<String>,
        display_name: impl Into<String>,
        sql: impl Into<String>,
        error: impl Into<String>,
        elapsed_millis: u64,
    ) -> Self {
        let error = error.into();
        Self {
            db_id: db_id.into(),
            display_name: display_name.into(),
            executed_sql: sql.into(),
            rows_extracted: 0,
            body: error.clone(),
            ok: false,
            error: Some(error),
            elapsed_millis,
        }
    }
}

/// Aggregated outcome across all sub-plans of one question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateResult {
    pub ok: bool,
    pub per_db: HashMap<String, DbResult>,
    pub errors: Vec<String>,
    pub elapsed_millis: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        use SubPlanState::*;
        assert!(Planned.can_advance_to(Generated));
        assert!(Generated.can_advance_to(Injected));
        assert!(Generated.can_advance_to(Executing));
        assert!(Injected.can_advance_to(Executing));
        assert!(Executing.can_advance_to(Done));
        assert!(Executing.can_advance_to(Failed));
        assert!(!Planned.can_advance_to(Executing));
        assert!(!Done.can_advance_to(Executing));
    }
}
