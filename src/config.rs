// SPDX-License-Identifier: Apache-2.0

//! Static configuration: one descriptor per target database, plus the
//! cross-database column mappings declared on each connection.
//!
//! Descriptors are created once at startup and immutable afterwards; the
//! descriptor `id` is the primary key everywhere else in the system.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::connection;
use crate::engine::dialect::SqlDialect;
use crate::engine::error::{EngineError, EngineResult};
use crate::observability::Sensitive;

pub const DEFAULT_ROW_CAP: u32 = 100;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// A declared equality between a column in one database and a column in
/// another. Inert unless both endpoint databases participate in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossMapping {
    pub source_db: String,
    pub source_table: String,
    pub source_column: String,
    pub target_db: String,
    pub target_table: String,
    pub target_column: String,
}

impl CrossMapping {
    /// True when both endpoints are among the given database ids
    /// (case-insensitive).
    pub fn is_active(&self, db_ids: &[&str]) -> bool {
        let has = |name: &str| db_ids.iter().any(|id| id.eq_ignore_ascii_case(name));
        has(&self.source_db) && has(&self.target_db)
    }
}

/// Raw per-database settings as they appear in configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSettings {
    #[serde(default)]
    pub name: Option<String>,
    pub dialect: String,
    pub connection_string: String,
    #[serde(default = "default_row_cap")]
    pub max_rows_per_query: u32,
    #[serde(default)]
    pub included_tables: Vec<String>,
    #[serde(default)]
    pub excluded_tables: Vec<String>,
    #[serde(default)]
    pub sensitive_columns: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub query_timeout_seconds: u64,
    #[serde(default)]
    pub cross_database_mappings: Vec<CrossMapping>,
}

fn default_row_cap() -> u32 {
    DEFAULT_ROW_CAP
}

fn default_timeout_secs() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}

/// Immutable identity of one target database.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseDescriptor {
    /// Primary key throughout the system: the configured name, or
    /// `<dialect>_<catalog>` when no name was given.
    pub id: String,
    pub display_name: String,
    pub dialect: SqlDialect,
    pub connection_string: Sensitive<String>,
    pub row_cap: u32,
    pub included_tables: Vec<String>,
    pub excluded_tables: Vec<String>,
    pub sensitive_columns: Vec<String>,
    pub query_timeout: Duration,
    pub cross_mappings: Vec<CrossMapping>,
}

impl DatabaseDescriptor {
    pub fn from_settings(settings: DatabaseSettings) -> EngineResult<Self> {
        let dialect = SqlDialect::from_name(&settings.dialect).ok_or_else(|| {
            EngineError::configuration(format!("Unknown dialect: {}", settings.dialect))
        })?;
        if settings.connection_string.trim().is_empty() {
            return Err(EngineError::configuration(
                "Connection string must not be empty",
            ));
        }

        let id = match settings.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!(
                "{}_{}",
                dialect.name(),
                connection::catalog_name(dialect, &settings.connection_string)
            ),
        };

        Ok(Self {
            display_name: id.clone(),
            id,
            dialect,
            connection_string: Sensitive::new(settings.connection_string),
            row_cap: settings.max_rows_per_query.max(1),
            included_tables: settings.included_tables,
            excluded_tables: settings.excluded_tables,
            sensitive_columns: settings.sensitive_columns,
            query_timeout: Duration::from_secs(settings.query_timeout_seconds.max(1)),
            cross_mappings: settings.cross_database_mappings,
        })
    }

    /// True when the given result-column header should be masked.
    pub fn is_sensitive_column(&self, column: &str) -> bool {
        let lower = column.to_lowercase();
        self.sensitive_columns
            .iter()
            .any(|s| !s.is_empty() && lower.contains(&s.to_lowercase()))
    }
}

/// Configuration for a whole mesh of databases.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshSettings {
    pub databases: Vec<DatabaseSettings>,
    /// Optional plan-wide deadline for a single `plan_and_execute` call.
    #[serde(default)]
    pub plan_deadline_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub databases: Vec<DatabaseDescriptor>,
    pub plan_deadline: Option<Duration>,
}

impl MeshConfig {
    pub fn from_settings(settings: MeshSettings) -> EngineResult<Self> {
        if settings.databases.is_empty() {
            return Err(EngineError::configuration("No databases configured"));
        }
        let mut databases = Vec::with_capacity(settings.databases.len());
        for db in settings.databases {
            databases.push(DatabaseDescriptor::from_settings(db)?);
        }
        // Descriptor ids are primary keys; duplicates are a startup error.
        for (i, a) in databases.iter().enumerate() {
            if databases[i + 1..]
                .iter()
                .any(|b| b.id.eq_ignore_ascii_case(&a.id))
            {
                return Err(EngineError::configuration(format!(
                    "Duplicate database id: {}",
                    a.id
                )));
            }
        }
        Ok(Self {
            databases,
            plan_deadline: settings.plan_deadline_seconds.map(Duration::from_secs),
        })
    }

    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let settings: MeshSettings = serde_json::from_str(json)
            .map_err(|e| EngineError::configuration(format!("Invalid configuration: {}", e)))?;
        Self::from_settings(settings)
    }

    /// Every configured cross mapping, across all descriptors.
    pub fn all_mappings(&self) -> Vec<CrossMapping> {
        let mut out = Vec::new();
        for db in &self.databases {
            for m in &db.cross_mappings {
                if !out.contains(m) {
                    out.push(m.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_id_defaults_to_dialect_and_catalog() {
        let settings = DatabaseSettings {
            name: None,
            dialect: "postgres".to_string(),
            connection_string: "postgres://u@h/warehouse".to_string(),
            max_rows_per_query: DEFAULT_ROW_CAP,
            included_tables: vec![],
            excluded_tables: vec![],
            sensitive_columns: vec![],
            query_timeout_seconds: 30,
            cross_database_mappings: vec![],
        };
        let descriptor = DatabaseDescriptor::from_settings(settings).unwrap();
        assert_eq!(descriptor.id, "postgres_warehouse");
    }

    #[test]
    fn configured_name_wins() {
        let json = r#"{
            "databases": [{
                "name": "SalesDb",
                "dialect": "mysql",
                "connectionString": "mysql://root@localhost/sales",
                "maxRowsPerQuery": 50,
                "sensitiveColumns": ["password", "Email"]
            }]
        }"#;
        let config = MeshConfig::from_json_str(json).unwrap();
        let db = &config.databases[0];
        assert_eq!(db.id, "SalesDb");
        assert_eq!(db.row_cap, 50);
        assert!(db.is_sensitive_column("user_password_hash"));
        assert!(db.is_sensitive_column("EMAIL_ADDRESS"));
        assert!(!db.is_sensitive_column("total"));
    }

    #[test]
    fn unknown_dialect_is_fatal() {
        let json = r#"{"databases":[{"dialect":"oracle","connectionString":"x"}]}"#;
        assert!(MeshConfig::from_json_str(json).is_err());
    }

    #[test]
    fn duplicate_ids_are_fatal() {
        let json = r#"{"databases":[
            {"name":"a","dialect":"sqlite","connectionString":":memory:"},
            {"name":"A","dialect":"sqlite","connectionString":":memory:"}
        ]}"#;
        let err = MeshConfig::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn mapping_is_active_only_with_both_endpoints() {
        let mapping = CrossMapping {
            source_db: "A".into(),
            source_table: "customers".into(),
            source_column: "id".into(),
            target_db: "B".into(),
            target_table: "orders".into(),
            target_column: "customer_id".into(),
        };
        assert!(mapping.is_active(&["a", "b"]));
        assert!(!mapping.is_active(&["a", "c"]));
    }
}
