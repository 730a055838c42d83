// SPDX-License-Identifier: Apache-2.0

//! SQL dialect adapters.
//!
//! One tagged variant per supported engine. Everything the planner needs to
//! know about an engine funnels through here: identifier quoting, row-limit
//! syntax, a cheap structural syntax check, and response formatting.

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::guard;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Sqlite,
    SqlServer,
    MySql,
    Postgres,
}

impl SqlDialect {
    /// Resolve a configured dialect name, accepting the common aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            "sqlserver" | "mssql" | "sql server" => Some(Self::SqlServer),
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::SqlServer => "sqlserver",
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Sqlite => "SQLite",
            Self::SqlServer => "SQL Server",
            Self::MySql => "MySQL",
            Self::Postgres => "PostgreSQL",
        }
    }

    /// Quote an identifier according to the engine's rules.
    ///
    /// SQLite accepts unquoted identifiers for anything the planner emits,
    /// so it returns the bare name.
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Self::Sqlite => ident.to_string(),
            Self::SqlServer => format!("[{}]", ident.replace(']', "]]")),
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
            Self::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// One-line description of the quoting rules, used in LLM prompts.
    pub fn quoting_hint(&self) -> &'static str {
        match self {
            Self::Sqlite => "identifiers are unquoted",
            Self::SqlServer => "quote identifiers with [square brackets]",
            Self::MySql => "quote identifiers with `backticks`",
            Self::Postgres => "quote identifiers with \"double quotes\"",
        }
    }

    /// Apply a row limit to a SELECT body: `LIMIT n` everywhere except
    /// SQL Server, which gets `TOP (n)` injected after the SELECT keyword.
    pub fn limit_clause(&self, top_n: u32, body: &str) -> String {
        match self {
            Self::SqlServer => inject_top(body, top_n),
            _ => {
                if contains_word_ci(body, "LIMIT") {
                    body.to_string()
                } else {
                    format!("{} LIMIT {}", body.trim_end().trim_end_matches(';'), top_n)
                }
            }
        }
    }

    /// Whether tables are qualified as `schema.table` in this engine.
    pub fn supports_schemas(&self) -> bool {
        matches!(self, Self::SqlServer | Self::Postgres)
    }

    pub fn default_schema(&self) -> Option<&'static str> {
        match self {
            Self::SqlServer => Some("dbo"),
            Self::Postgres => Some("public"),
            _ => None,
        }
    }

    /// Cheap structural syntax check: balanced parentheses, a SELECT/WITH
    /// head, and no forbidden verbs. This is deliberately not a parse.
    pub fn syntax_check(&self, sql: &str) -> EngineResult<()> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Err(EngineError::generation("Empty SQL statement"));
        }
        if let Some(kw) = guard::forbidden_keyword(trimmed) {
            return Err(EngineError::generation(format!(
                "Statement contains forbidden keyword: {}",
                kw
            )));
        }
        if !guard::starts_with_select(trimmed) {
            return Err(EngineError::generation(
                "Statement must begin with SELECT or WITH",
            ));
        }
        if !parens_balanced(trimmed) {
            return Err(EngineError::generation("Unbalanced parentheses"));
        }
        Ok(())
    }

    /// Normalise model output into a single executable line: strip fenced
    /// code artefacts and comments, collapse whitespace outside string
    /// literals, drop a trailing semicolon.
    pub fn format_sql(&self, sql: &str) -> String {
        let defenced = strip_fences(sql);
        let uncommented = strip_comments(&defenced);
        let collapsed = collapse_whitespace(&uncommented);
        collapsed.trim().trim_end_matches(';').trim().to_string()
    }
}

/// Remove `-- line` and `/* block */` comments outside string literals.
pub fn strip_comments(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    let mut in_literal = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_literal {
            out.push(c);
            if c == '\'' {
                in_literal = false;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' => {
                in_literal = true;
                out.push(c);
                i += 1;
            }
            '-' if i + 1 < bytes.len() && bytes[i + 1] == b'-' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                out.push(' ');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Remove ``` fences (with or without a language tag) anywhere in the text.
pub fn strip_fences(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for line in sql.lines() {
        let t = line.trim();
        if t.starts_with("```") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Collapse every run of whitespace to a single space, leaving the contents
/// of single-quoted literals untouched.
pub fn collapse_whitespace(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut pending_space = false;

    for ch in sql.chars() {
        if in_literal {
            out.push(ch);
            if ch == '\'' {
                in_literal = false;
            }
            continue;
        }
        if ch == '\'' {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            in_literal = true;
            out.push(ch);
            continue;
        }
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }
    out
}

/// Balanced-parenthesis check that skips single-quoted literals.
pub fn parens_balanced(sql: &str) -> bool {
    let mut depth: i32 = 0;
    let mut in_literal = false;
    for ch in sql.chars() {
        match ch {
            '\'' => in_literal = !in_literal,
            '(' if !in_literal => depth += 1,
            ')' if !in_literal => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0 && !in_literal
}

/// Case-insensitive whole-word containment outside string literals.
pub fn contains_word_ci(sql: &str, word: &str) -> bool {
    guard::words_outside_literals(sql).any(|w| w.eq_ignore_ascii_case(word))
}

fn inject_top(body: &str, top_n: u32) -> String {
    let trimmed = body.trim_end().trim_end_matches(';');
    if contains_word_ci(trimmed, "TOP") {
        return trimmed.to_string();
    }
    // Insert after the leading SELECT (and DISTINCT when present).
    let mut upper = trimmed.to_string();
    upper.make_ascii_uppercase();
    let Some(sel) = upper.find("SELECT") else {
        return trimmed.to_string();
    };
    let mut insert_at = sel + "SELECT".len();
    let after = &upper[insert_at..];
    let after_trim = after.trim_start();
    if after_trim.starts_with("DISTINCT") {
        let skipped = after.len() - after_trim.len();
        insert_at += skipped + "DISTINCT".len();
    }
    format!(
        "{} TOP ({}){}",
        &trimmed[..insert_at],
        top_n,
        &trimmed[insert_at..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_from_name_accepts_aliases() {
        assert_eq!(SqlDialect::from_name("PostgreSQL"), Some(SqlDialect::Postgres));
        assert_eq!(SqlDialect::from_name("mssql"), Some(SqlDialect::SqlServer));
        assert_eq!(SqlDialect::from_name("MariaDB"), Some(SqlDialect::MySql));
        assert_eq!(SqlDialect::from_name("sqlite3"), Some(SqlDialect::Sqlite));
        assert_eq!(SqlDialect::from_name("oracle"), None);
    }

    #[test]
    fn quoting_per_engine() {
        assert_eq!(SqlDialect::Sqlite.quote("orders"), "orders");
        assert_eq!(SqlDialect::SqlServer.quote("orders"), "[orders]");
        assert_eq!(SqlDialect::MySql.quote("orders"), "`orders`");
        assert_eq!(SqlDialect::Postgres.quote("orders"), "\"orders\"");
    }

    #[test]
    fn limit_clause_appends_limit() {
        let sql = SqlDialect::MySql.limit_clause(3, "SELECT id FROM t");
        assert_eq!(sql, "SELECT id FROM t LIMIT 3");
        // Idempotent when a LIMIT is already present.
        assert_eq!(SqlDialect::MySql.limit_clause(3, &sql), sql);
    }

    #[test]
    fn limit_clause_injects_top_for_sqlserver() {
        let sql = SqlDialect::SqlServer.limit_clause(5, "SELECT id FROM t");
        assert_eq!(sql, "SELECT TOP (5) id FROM t");

        let distinct = SqlDialect::SqlServer.limit_clause(5, "SELECT DISTINCT id FROM t");
        assert_eq!(distinct, "SELECT DISTINCT TOP (5) id FROM t");
    }

    #[test]
    fn syntax_check_rejects_non_select() {
        assert!(SqlDialect::Sqlite.syntax_check("SELECT 1").is_ok());
        assert!(SqlDialect::Sqlite.syntax_check("WITH x AS (SELECT 1) SELECT * FROM x").is_ok());
        assert!(SqlDialect::Sqlite.syntax_check("UPDATE t SET a = 1").is_err());
        assert!(SqlDialect::Sqlite.syntax_check("SELECT (1").is_err());
    }

    #[test]
    fn format_sql_strips_fences_and_collapses() {
        let raw = "```sql\nSELECT  id,\n    name\nFROM users;\n```";
        assert_eq!(
            SqlDialect::Postgres.format_sql(raw),
            "SELECT id, name FROM users"
        );
    }

    #[test]
    fn format_sql_preserves_literals() {
        let raw = "SELECT * FROM t WHERE city = 'New    York'";
        assert_eq!(SqlDialect::Sqlite.format_sql(raw), raw);
    }

    #[test]
    fn format_sql_drops_comments() {
        let raw = "SELECT id -- the key\nFROM t /* main table */ WHERE a = 1";
        assert_eq!(
            SqlDialect::Sqlite.format_sql(raw),
            "SELECT id FROM t WHERE a = 1"
        );
    }

    #[test]
    fn parens_ignore_literals() {
        assert!(parens_balanced("SELECT ':)' FROM t"));
        assert!(!parens_balanced("SELECT (1 FROM t"));
    }
}
