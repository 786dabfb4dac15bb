//! Pre-validated SQL statements
//!
//! Nothing reaches SQLite as free-form text. Every statement the crate runs is
//! rendered from a [`StatementTemplate`] and must pass [`validate_statement`]
//! before a [`ValidatedStatement`] exists. Values are always bound as
//! parameters; only table and column names are interpolated, and those are
//! checked by [`validate_identifier`] first.
//!
//! # Rejected shapes
//!
//! - anything not starting with `SELECT`, `DELETE`, `UPDATE`, `INSERT` or `PRAGMA`
//! - statement separators (`;`), anywhere
//! - comment markers (`--`, `/*`, `*/`)
//! - DDL and attachment keywords (`DROP`, `CREATE`, `ALTER`, `ATTACH`, ...)
//! - more than one data-modifying verb (multi-statement payloads)
//! - pragmas other than the integrity checks

use crate::error::{IdResetError, Result};
use crate::patterns::DatabaseSchema;
use std::fmt;

/// Leading verbs a statement may start with
pub const ALLOWED_VERBS: &[&str] = &["SELECT", "DELETE", "UPDATE", "INSERT", "PRAGMA"];

/// Keywords that never appear in a statement we run
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "DROP", "CREATE", "ALTER", "ATTACH", "DETACH", "TRUNCATE", "RENAME", "REINDEX", "VACUUM",
    "TRIGGER", "GRANT", "REVOKE",
];

const MODIFYING_VERBS: &[&str] = &["DELETE", "UPDATE", "INSERT"];

const ALLOWED_PRAGMAS: &[&str] = &["INTEGRITY_CHECK", "QUICK_CHECK"];

const MAX_IDENTIFIER_LEN: usize = 64;
const MAX_PATTERN_LEN: usize = 256;
const MIN_PATTERN_LITERALS: usize = 3;

/// A statement that passed shape validation.
///
/// Only constructible through [`ValidatedStatement::new`] or
/// [`StatementTemplate::render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedStatement(String);

impl ValidatedStatement {
    /// Validate `sql` and wrap it
    pub fn new(sql: impl Into<String>) -> Result<Self> {
        let sql = sql.into();
        validate_statement(&sql)?;
        Ok(Self(sql))
    }

    pub fn sql(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValidatedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Split a statement into upper-cased words (identifier-like runs)
fn words(sql: &str) -> impl Iterator<Item = String> + '_ {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase())
}

/// Check a statement against the allowed shape.
///
/// # Errors
///
/// Returns [`IdResetError::QueryRejected`] naming the first violated rule.
pub fn validate_statement(sql: &str) -> Result<()> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(IdResetError::rejected("empty statement"));
    }
    if trimmed.contains(';') {
        return Err(IdResetError::rejected("statement separator ';' is not allowed"));
    }
    if trimmed.contains("--") || trimmed.contains("/*") || trimmed.contains("*/") {
        return Err(IdResetError::rejected("comment markers are not allowed"));
    }
    if trimmed
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\t' | '\r'))
    {
        return Err(IdResetError::rejected("control characters are not allowed"));
    }

    let all: Vec<String> = words(trimmed).collect();
    let verb = all.first().map(String::as_str).unwrap_or_default();
    if !ALLOWED_VERBS.contains(&verb) {
        return Err(IdResetError::rejected(format!(
            "statement must start with one of {:?}, found '{}'",
            ALLOWED_VERBS, verb
        )));
    }

    if let Some(keyword) = all.iter().find(|w| FORBIDDEN_KEYWORDS.contains(&w.as_str())) {
        return Err(IdResetError::rejected(format!("keyword {} is not allowed", keyword)));
    }

    let modifying = all
        .iter()
        .filter(|w| MODIFYING_VERBS.contains(&w.as_str()))
        .count();
    if modifying > 1 {
        return Err(IdResetError::rejected("multiple data-modifying verbs in one statement"));
    }

    if verb == "PRAGMA" {
        let rest: Vec<&String> = all.iter().skip(1).collect();
        let allowed = rest.len() == 1 && ALLOWED_PRAGMAS.contains(&rest[0].as_str());
        if !allowed {
            return Err(IdResetError::rejected(format!(
                "only {:?} pragmas are allowed",
                ALLOWED_PRAGMAS
            )));
        }
    }

    Ok(())
}

/// Check a table or column name before it is interpolated into a template
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
        return Err(IdResetError::configuration(format!(
            "SQL identifier '{}' must be 1-{} characters",
            name, MAX_IDENTIFIER_LEN
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(IdResetError::configuration(format!(
            "SQL identifier '{}' may only contain letters, digits and underscores",
            name
        )));
    }
    let upper = name.to_ascii_uppercase();
    if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) || ALLOWED_VERBS.contains(&upper.as_str()) {
        return Err(IdResetError::configuration(format!(
            "SQL identifier '{}' is a reserved keyword",
            name
        )));
    }
    Ok(())
}

/// Check a `LIKE` row pattern from configuration.
///
/// Patterns are bound as parameters, so this is about blast radius rather than
/// injection: a pattern needs at least three literal characters, which keeps
/// `%` or `_%` from matching every row.
pub fn validate_like_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() || pattern.len() > MAX_PATTERN_LEN {
        return Err(IdResetError::configuration(format!(
            "row pattern must be 1-{} characters",
            MAX_PATTERN_LEN
        )));
    }
    if pattern.chars().any(char::is_control) {
        return Err(IdResetError::configuration(format!(
            "row pattern {:?} contains control characters",
            pattern
        )));
    }
    if pattern.contains(';') || pattern.contains("--") || pattern.contains("/*") {
        return Err(IdResetError::configuration(format!(
            "row pattern {:?} contains SQL syntax",
            pattern
        )));
    }
    let literals = pattern.chars().filter(|c| !matches!(c, '%' | '_')).count();
    if literals < MIN_PATTERN_LITERALS {
        return Err(IdResetError::configuration(format!(
            "row pattern {:?} is too broad (needs at least {} literal characters)",
            pattern, MIN_PATTERN_LITERALS
        )));
    }
    Ok(())
}

/// Match `text` against a LIKE pattern outside the database.
///
/// Same semantics as SQLite's default `LIKE`: `%` spans any run of
/// characters, `_` exactly one, ASCII letters compare case-insensitively.
pub fn like_matches(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // Last `%` seen and the text position it currently absorbs up to
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '%' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '_' || p[pi].eq_ignore_ascii_case(&t[ti])) {
            pi += 1;
            ti += 1;
        } else if let Some((star, absorbed)) = backtrack {
            pi = star + 1;
            ti = absorbed + 1;
            backtrack = Some((star, absorbed + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '%')
}

/// The complete set of statements the crate ever sends to SQLite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementTemplate {
    /// `?1` = table name
    TableExists,
    IntegrityCheck,
    /// `?1` = LIKE pattern
    CountLike,
    /// `?1` = LIKE pattern
    KeysLike,
    /// `?1` = LIKE pattern
    DeleteLike,
    /// `?1` = key
    SelectValue,
    /// `?1` = key, `?2` = value
    Upsert,
}

impl StatementTemplate {
    /// Render against a configured schema and validate the result
    pub fn render(self, schema: &DatabaseSchema) -> Result<ValidatedStatement> {
        validate_identifier(&schema.table)?;
        validate_identifier(&schema.key_column)?;
        validate_identifier(&schema.value_column)?;

        let (t, k, v) = (&schema.table, &schema.key_column, &schema.value_column);
        let sql = match self {
            Self::TableExists => {
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1".to_string()
            }
            Self::IntegrityCheck => "PRAGMA integrity_check".to_string(),
            Self::CountLike => format!("SELECT COUNT(*) FROM \"{t}\" WHERE \"{k}\" LIKE ?1"),
            Self::KeysLike => format!("SELECT \"{k}\" FROM \"{t}\" WHERE \"{k}\" LIKE ?1"),
            Self::DeleteLike => format!("DELETE FROM \"{t}\" WHERE \"{k}\" LIKE ?1"),
            Self::SelectValue => format!("SELECT \"{v}\" FROM \"{t}\" WHERE \"{k}\" = ?1"),
            Self::Upsert => {
                format!("INSERT OR REPLACE INTO \"{t}\" (\"{k}\", \"{v}\") VALUES (?1, ?2)")
            }
        };
        ValidatedStatement::new(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> DatabaseSchema {
        DatabaseSchema {
            table: "ItemTable".into(),
            key_column: "key".into(),
            value_column: "value".into(),
            extensions: vec![".vscdb".into()],
        }
    }

    #[test]
    fn test_every_template_renders_and_validates() {
        let templates = [
            StatementTemplate::TableExists,
            StatementTemplate::IntegrityCheck,
            StatementTemplate::CountLike,
            StatementTemplate::KeysLike,
            StatementTemplate::DeleteLike,
            StatementTemplate::SelectValue,
            StatementTemplate::Upsert,
        ];
        for template in templates {
            let stmt = template.render(&schema()).expect("template must validate");
            assert!(!stmt.sql().contains(';'));
        }
    }

    #[test]
    fn test_rejects_statement_separator() {
        let err = validate_statement("DELETE FROM ItemTable WHERE key LIKE ?1; SELECT 1")
            .unwrap_err();
        assert!(err.to_string().contains("separator"));
    }

    #[test]
    fn test_rejects_comment_markers() {
        assert!(validate_statement("SELECT value FROM ItemTable -- trailing").is_err());
        assert!(validate_statement("SELECT /* hidden */ value FROM ItemTable").is_err());
    }

    #[test]
    fn test_rejects_ddl_keywords() {
        assert!(validate_statement("DELETE FROM ItemTable WHERE key IN (DROP)").is_err());
        assert!(validate_statement("SELECT * FROM ItemTable WHERE x = 'ATTACH'").is_err());
        assert!(validate_statement("CREATE TABLE evil (x)").is_err());
    }

    #[test]
    fn test_rejects_unknown_leading_verb() {
        assert!(validate_statement("VACUUM").is_err());
        assert!(validate_statement("WITH x AS (SELECT 1) DELETE FROM t").is_err());
    }

    #[test]
    fn test_rejects_multiple_modifying_verbs() {
        assert!(validate_statement("DELETE FROM t WHERE k IN (INSERT INTO t VALUES (1))").is_err());
    }

    #[test]
    fn test_pragma_whitelist() {
        assert!(validate_statement("PRAGMA integrity_check").is_ok());
        assert!(validate_statement("PRAGMA quick_check").is_ok());
        assert!(validate_statement("PRAGMA writable_schema = 1").is_err());
        assert!(validate_statement("PRAGMA journal_mode").is_err());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("ItemTable").is_ok());
        assert!(validate_identifier("_private2").is_ok());
        assert!(validate_identifier("Item Table").is_err());
        assert!(validate_identifier("x\"; DROP").is_err());
        assert!(validate_identifier("drop").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_like_pattern_validation() {
        assert!(validate_like_pattern("telemetry.%").is_ok());
        assert!(validate_like_pattern("%machineId%").is_ok());
        assert!(validate_like_pattern("%").is_err());
        assert!(validate_like_pattern("_%_").is_err());
        assert!(validate_like_pattern("abc%; DELETE").is_err());
    }

    #[test]
    fn test_like_matching_follows_sqlite() {
        assert!(like_matches("%augment.%", "augment.vscode-augment-0.482.1"));
        assert!(like_matches("%augment.%", "Augment.vscode-augment"));
        assert!(like_matches("telemetry.%", "telemetry.machineId"));
        assert!(like_matches("%machineId%", "storage.serviceMachineId"));
        assert!(like_matches("a_c", "abc"));
        assert!(!like_matches("%augment.%", "augmented-reality"));
        assert!(!like_matches("telemetry.%", "my.telemetry.id"));
        assert!(!like_matches("a_c", "ac"));
    }

    #[test]
    fn test_like_matching_agrees_with_database() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        for (pattern, text) in [
            ("%context7.%", "Context7.mcp-1.0"),
            ("%sqmId%", "telemetry.sqmId"),
            ("%a%b%", "xaxxbx"),
            ("%a%b%", "xbxa"),
            ("_%_", "z"),
        ] {
            let expected: bool = conn
                .query_row("SELECT ?2 LIKE ?1", rusqlite::params![pattern, text], |row| row.get(0))
                .unwrap();
            assert_eq!(like_matches(pattern, text), expected, "{} LIKE {}", text, pattern);
        }
    }

    #[test]
    fn test_bad_schema_blocks_rendering() {
        let mut bad = schema();
        bad.table = "ItemTable\" WHERE 1".into();
        assert!(StatementTemplate::DeleteLike.render(&bad).is_err());
    }
}
