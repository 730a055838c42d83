// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the query mesh engine
//!
//! All driver-, planner-, and generator-specific failures are mapped to these
//! unified error types so every component reports consistently.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all engine operations
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Schema introspection failed: {message}")]
    Introspection { message: String },

    #[error("Planning failed: {message}")]
    Planning { message: String },

    #[error("SQL generation failed: {message}")]
    Generation { message: String },

    #[error("Query execution error: {message}")]
    Execution { message: String },

    #[error("{message}")]
    Guard { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration { message: msg.into() }
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn introspection(msg: impl Into<String>) -> Self {
        Self::Introspection { message: msg.into() }
    }

    pub fn planning(msg: impl Into<String>) -> Self {
        Self::Planning { message: msg.into() }
    }

    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation { message: msg.into() }
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution { message: msg.into() }
    }

    pub fn guard(msg: impl Into<String>) -> Self {
        Self::Guard { message: msg.into() }
    }

    /// True when the error is the distinguished cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout { .. })
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
