//! SQLite key/value stores
//!
//! Every statement comes from [`StatementTemplate`]; every call runs under a
//! deadline enforced through SQLite's progress handler, so a query can never
//! block past the configured timeout.

use crate::artifact::DbProbe;
use crate::error::{IdResetError, Result};
use crate::patterns::{DatabaseSchema, PatternConfig};
use crate::sql::{StatementTemplate, ValidatedStatement};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Progress handler granularity (VM instructions between deadline checks)
const PROGRESS_OPS: i32 = 1000;

/// Outcome of `PRAGMA integrity_check`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub ok: bool,
    pub detail: Option<String>,
}

/// An open identifier database
pub struct SqliteStore {
    conn: Connection,
    schema: DatabaseSchema,
    path: PathBuf,
    timeout: Duration,
}

impl SqliteStore {
    /// Open without write access. Never creates the file.
    pub fn open_read_only(path: &Path, schema: &DatabaseSchema, timeout: Duration) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Self::open(path, schema, timeout, flags)
    }

    /// Open for mutation. Never creates the file.
    pub fn open_read_write(path: &Path, schema: &DatabaseSchema, timeout: Duration) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Self::open(path, schema, timeout, flags)
    }

    fn open(
        path: &Path,
        schema: &DatabaseSchema,
        timeout: Duration,
        flags: OpenFlags,
    ) -> Result<Self> {
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(timeout)?;
        Ok(Self {
            conn,
            schema: schema.clone(),
            path: path.to_path_buf(),
            timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn statement(&self, template: StatementTemplate) -> Result<ValidatedStatement> {
        template.render(&self.schema)
    }

    /// Run `f` with the deadline armed, translating an interrupt into a timeout
    fn guarded<T>(
        &self,
        what: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + self.timeout;
        self.conn
            .progress_handler(PROGRESS_OPS, Some(move || Instant::now() > deadline));
        let result = f(&self.conn);
        self.conn.progress_handler(0, None::<fn() -> bool>);

        result.map_err(|e| match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == ErrorCode::OperationInterrupted =>
            {
                IdResetError::Timeout {
                    what: format!("{} on {}", what, self.path.display()),
                    secs: self.timeout.as_secs(),
                }
            }
            _ => IdResetError::Sqlite(e),
        })
    }

    /// Whether the configured key/value table exists
    pub fn table_exists(&self) -> Result<bool> {
        let stmt = self.statement(StatementTemplate::TableExists)?;
        let count: i64 = self.guarded("table lookup", |c| {
            c.query_row(stmt.sql(), params![self.schema.table], |row| row.get(0))
        })?;
        Ok(count > 0)
    }

    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let stmt = self.statement(StatementTemplate::IntegrityCheck)?;
        let lines: Vec<String> = self.guarded("integrity check", |c| {
            let mut prepared = c.prepare(stmt.sql())?;
            let rows = prepared.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })?;
        let ok = lines.len() == 1 && lines[0].eq_ignore_ascii_case("ok");
        Ok(IntegrityReport {
            ok,
            detail: (!ok).then(|| lines.join("; ")),
        })
    }

    pub fn count_like(&self, pattern: &str) -> Result<u64> {
        let stmt = self.statement(StatementTemplate::CountLike)?;
        let count: i64 = self.guarded("row count", |c| {
            c.query_row(stmt.sql(), params![pattern], |row| row.get(0))
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn keys_like(&self, pattern: &str) -> Result<Vec<String>> {
        let stmt = self.statement(StatementTemplate::KeysLike)?;
        self.guarded("key listing", |c| {
            let mut prepared = c.prepare(stmt.sql())?;
            let rows = prepared.query_map(params![pattern], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
    }

    /// Read one value as text. Blobs are decoded lossily; NULL reads as absent.
    pub fn read_value(&self, key: &str) -> Result<Option<String>> {
        let stmt = self.statement(StatementTemplate::SelectValue)?;
        let value: Option<Value> = self.guarded("value read", |c| {
            c.query_row(stmt.sql(), params![key], |row| row.get::<_, Value>(0))
                .optional()
        })?;
        Ok(value.and_then(value_to_string))
    }

    /// Probe contents for planning. Read-only.
    pub fn probe(&self, patterns: &PatternConfig) -> Result<DbProbe> {
        let integrity = self.integrity_check()?;
        let mut probe = DbProbe {
            table_present: false,
            integrity_ok: integrity.ok,
            integrity_detail: integrity.detail,
            ..Default::default()
        };
        if !integrity.ok || !self.table_exists()? {
            return Ok(probe);
        }
        probe.table_present = true;

        for def in &patterns.identifiers {
            if self.read_value(&def.key)?.is_some() {
                probe.identifier_keys.push(def.key.clone());
            }
        }
        for pattern in patterns.delete_patterns() {
            let count = self.count_like(pattern)?;
            probe.pattern_matches.insert(pattern.to_string(), count);
        }
        Ok(probe)
    }

    /// Delete rows matching `patterns`, then write `writes`, in one transaction.
    ///
    /// Returns the number of rows deleted (including rows that are re-written).
    pub fn delete_and_upsert(&self, patterns: &[String], writes: &[(String, String)]) -> Result<u64> {
        let delete = self.statement(StatementTemplate::DeleteLike)?;
        let upsert = self.statement(StatementTemplate::Upsert)?;

        let deleted = self.guarded("delete/upsert", |c| {
            let tx = c.unchecked_transaction()?;
            let mut deleted = 0usize;
            for pattern in patterns {
                deleted += tx.execute(delete.sql(), params![pattern])?;
            }
            for (key, value) in writes {
                tx.execute(upsert.sql(), params![key, value])?;
            }
            tx.commit()?;
            Ok(deleted)
        })?;
        debug!(
            "{}: deleted {} row(s), wrote {} key(s)",
            self.path.display(),
            deleted,
            writes.len()
        );
        Ok(deleted as u64)
    }
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(r) => Some(r.to_string()),
        Value::Text(s) => Some(s),
        Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(rows: &[(&str, &str)]) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.vscdb");
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "CREATE TABLE ItemTable (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB)",
            [],
        )
        .unwrap();
        for (k, v) in rows {
            conn.execute("INSERT INTO ItemTable (key, value) VALUES (?1, ?2)", params![k, v])
                .unwrap();
        }
        (dir, path)
    }

    fn patterns() -> PatternConfig {
        PatternConfig::builtin().unwrap()
    }

    #[test]
    fn test_scan_reports_identifier_keys_and_matches() {
        let (_dir, path) = fixture(&[
            ("telemetry.machineId", "abc"),
            ("telemetry.someFlag", "1"),
            ("foo", "bar"),
        ]);
        let p = patterns();
        let store = SqliteStore::open_read_only(&path, &p.database, Duration::from_secs(5)).unwrap();
        let probe = store.probe(&p).unwrap();
        assert!(probe.table_present);
        assert!(probe.integrity_ok);
        assert_eq!(probe.identifier_keys, vec!["telemetry.machineId".to_string()]);
        assert_eq!(probe.pattern_matches.get("telemetry.%"), Some(&2));
    }

    #[test]
    fn test_delete_and_upsert_leaves_unrelated_rows() {
        let (_dir, path) = fixture(&[("telemetry.machineId", "abc"), ("foo", "bar")]);
        let p = patterns();
        let store = SqliteStore::open_read_write(&path, &p.database, Duration::from_secs(5)).unwrap();
        let deleted = store
            .delete_and_upsert(
                &["telemetry.%".to_string()],
                &[("telemetry.machineId".into(), "new".into())],
            )
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.read_value("telemetry.machineId").unwrap().as_deref(), Some("new"));
        assert_eq!(store.read_value("foo").unwrap().as_deref(), Some("bar"));
    }

    #[test]
    fn test_long_query_is_interrupted_at_deadline() {
        let (_dir, path) = fixture(&[]);
        let p = patterns();
        let store = SqliteStore::open_read_only(&path, &p.database, Duration::from_millis(20)).unwrap();

        let started = Instant::now();
        // Bounded so a missing interrupt fails instead of hanging
        let result = store.guarded("counting", |c| {
            c.query_row(
                "WITH RECURSIVE r(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM r LIMIT 500000000) \
                 SELECT count(*) FROM r",
                [],
                |row| row.get::<_, i64>(0),
            )
        });

        match result {
            Err(IdResetError::Timeout { what, .. }) => assert!(what.contains("counting"), "{}", what),
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        // The handler is disarmed afterwards
        assert!(store.table_exists().unwrap());
    }

    #[test]
    fn test_missing_table_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.db");
        Connection::open(&path)
            .unwrap()
            .execute("CREATE TABLE things (x)", [])
            .unwrap();
        let p = patterns();
        let store = SqliteStore::open_read_only(&path, &p.database, Duration::from_secs(5)).unwrap();
        let probe = store.probe(&p).unwrap();
        assert!(!probe.table_present);
        assert!(probe.identifier_keys.is_empty());
    }

    #[test]
    fn test_non_database_file_errors_on_first_query() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.vscdb");
        std::fs::write(&path, b"this is not sqlite at all, just text padding").unwrap();
        let p = patterns();
        let result = SqliteStore::open_read_only(&path, &p.database, Duration::from_secs(5))
            .and_then(|s| s.probe(&p));
        assert!(result.is_err());
    }

    #[test]
    fn test_read_only_open_does_not_create_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.vscdb");
        let p = patterns();
        assert!(SqliteStore::open_read_only(&path, &p.database, Duration::from_secs(5)).is_err());
        assert!(!path.exists());
    }
}
