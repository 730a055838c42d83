// SPDX-License-Identifier: Apache-2.0

//! Execution gate for model-produced SQL.
//!
//! Only plain `SELECT`/`WITH` statements get through. Everything else —
//! mutation verbs, stored-procedure escapes, comment-based injection
//! patterns — is refused before any connection is opened.

use sqlparser::ast::Statement;
use sqlparser::dialect::{
    Dialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use sqlparser::parser::Parser;

use crate::engine::dialect::SqlDialect;
use crate::engine::error::{EngineError, EngineResult};

/// Verbs that must never appear in an executable statement, whole-word.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "ALTER", "CREATE", "EXEC", "EXECUTE",
];

/// Word prefixes reserved for stored-procedure escapes.
const FORBIDDEN_PREFIXES: &[&str] = &["SP_", "XP_"];

/// Substrings that mark a potentially injected statement.
const INJECTION_MARKERS: &[&str] = &[";--", ";/*", "--", "/*"];

/// Iterate the bare words of a statement, skipping single-quoted literals.
/// Quoted identifiers are yielded without their quoting characters so that
/// `[drop]` and `drop` look the same to the keyword scan.
pub fn words_outside_literals(sql: &str) -> impl Iterator<Item = &str> {
    let bytes = sql.as_bytes();
    let mut words = Vec::new();
    let mut i = 0;
    let mut in_literal = false;
    let mut word_start: Option<usize> = None;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_literal {
            if c == '\'' {
                in_literal = false;
            }
            i += 1;
            continue;
        }
        if c == '\'' {
            if let Some(start) = word_start.take() {
                words.push(&sql[start..i]);
            }
            in_literal = true;
            i += 1;
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            if word_start.is_none() {
                word_start = Some(i);
            }
        } else if let Some(start) = word_start.take() {
            words.push(&sql[start..i]);
        }
        i += 1;
    }
    if let Some(start) = word_start {
        words.push(&sql[start..]);
    }
    words.into_iter()
}

/// First forbidden verb found in the statement, if any.
pub fn forbidden_keyword(sql: &str) -> Option<&'static str> {
    for word in words_outside_literals(sql) {
        for kw in FORBIDDEN_KEYWORDS {
            if word.eq_ignore_ascii_case(kw) {
                return Some(kw);
            }
        }
        for prefix in FORBIDDEN_PREFIXES {
            if word.len() >= prefix.len()
                && word[..prefix.len()].eq_ignore_ascii_case(prefix)
            {
                return Some(prefix);
            }
        }
    }
    None
}

/// First injection marker found in the statement, if any. `UNION` is checked
/// whole-word outside literals; comment markers are raw substrings.
pub fn injection_marker(sql: &str) -> Option<&'static str> {
    if words_outside_literals(sql).any(|w| w.eq_ignore_ascii_case("UNION")) {
        return Some("UNION");
    }
    INJECTION_MARKERS.iter().find(|m| sql.contains(*m)).copied()
}

/// True when the first significant keyword is `SELECT` or `WITH`.
pub fn starts_with_select(sql: &str) -> bool {
    match words_outside_literals(sql).next() {
        Some(first) => {
            first.eq_ignore_ascii_case("SELECT") || first.eq_ignore_ascii_case("WITH")
        }
        None => false,
    }
}

/// The full execution gate. Refusal order matters: a `DROP TABLE x` must be
/// reported as a dangerous keyword, not as a missing SELECT head.
pub fn ensure_select_only(dialect: SqlDialect, sql: &str) -> EngineResult<()> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(EngineError::guard("Query is empty"));
    }
    if let Some(kw) = forbidden_keyword(trimmed) {
        return Err(EngineError::guard(format!(
            "Query contains dangerous keyword: {}",
            kw
        )));
    }
    if let Some(marker) = injection_marker(trimmed) {
        return Err(EngineError::guard(format!(
            "Query contains potentially injected pattern: {}",
            marker
        )));
    }
    if !starts_with_select(trimmed) {
        return Err(EngineError::guard(
            "Only SELECT and WITH statements are permitted",
        ));
    }
    // Best-effort parse: when the statement is parseable, confirm it really
    // is a query. Unparseable text falls through to the driver, which will
    // reject anything the structural checks above let slip.
    if let Some(false) = parses_as_query(dialect, trimmed) {
        return Err(EngineError::guard(
            "Only SELECT and WITH statements are permitted",
        ));
    }
    Ok(())
}

/// `Some(true)` if every parsed statement is a query, `Some(false)` if any
/// is not, `None` when the text does not parse.
fn parses_as_query(dialect: SqlDialect, sql: &str) -> Option<bool> {
    let parsed = match dialect {
        SqlDialect::Sqlite => Parser::parse_sql(&SQLiteDialect {}, sql),
        SqlDialect::SqlServer => Parser::parse_sql(&MsSqlDialect {}, sql),
        SqlDialect::MySql => Parser::parse_sql(&MySqlDialect {}, sql),
        SqlDialect::Postgres => Parser::parse_sql(&PostgreSqlDialect {}, sql),
    };
    let statements = match parsed {
        Ok(s) => s,
        Err(_) => {
            let generic: &dyn Dialect = &GenericDialect {};
            Parser::parse_sql(generic, sql).ok()?
        }
    };
    Some(statements.iter().all(|s| matches!(s, Statement::Query(_))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_plain_select() {
        assert!(ensure_select_only(SqlDialect::Sqlite, "SELECT * FROM users").is_ok());
        assert!(ensure_select_only(
            SqlDialect::Postgres,
            "WITH t AS (SELECT 1 AS n) SELECT n FROM t"
        )
        .is_ok());
    }

    #[test]
    fn rejects_drop_with_keyword_message() {
        let err = ensure_select_only(SqlDialect::Sqlite, "DROP TABLE x").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Query contains dangerous keyword: DROP"
        );
    }

    #[test]
    fn rejects_procedure_escapes() {
        let err =
            ensure_select_only(SqlDialect::SqlServer, "SELECT * FROM t; EXEC xp_cmdshell 'dir'")
                .unwrap_err();
        assert!(err.to_string().contains("EXEC"));

        assert!(forbidden_keyword("SELECT xp_cmdshell FROM t").is_some());
    }

    #[test]
    fn rejects_comment_injection() {
        let err = ensure_select_only(SqlDialect::MySql, "SELECT * FROM t --").unwrap_err();
        assert!(err.to_string().contains("injected"));
        assert!(ensure_select_only(SqlDialect::MySql, "SELECT * FROM t /* x */").is_err());
    }

    #[test]
    fn rejects_union() {
        assert!(ensure_select_only(
            SqlDialect::Postgres,
            "SELECT a FROM t UNION SELECT b FROM u"
        )
        .is_err());
    }

    #[test]
    fn keywords_in_literals_are_fine() {
        assert!(ensure_select_only(
            SqlDialect::Sqlite,
            "SELECT * FROM audit WHERE action = 'DELETE'"
        )
        .is_ok());
    }

    #[test]
    fn delete_as_word_is_caught() {
        assert_eq!(forbidden_keyword("SELECT 1; DELETE FROM t"), Some("DELETE"));
        // Substring inside a longer identifier is not a word match.
        assert_eq!(forbidden_keyword("SELECT deleted_at FROM t"), None);
    }

    #[test]
    fn rejects_non_select_head() {
        let err = ensure_select_only(SqlDialect::Sqlite, "PRAGMA table_info(x)").unwrap_err();
        assert!(err.to_string().contains("SELECT"));
    }
}
