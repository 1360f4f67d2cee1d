#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use quiz_stats_core::{
    merge_delta, AggregateRow, AggregateView, Identity, SessionInput, SessionLog, SessionRecord,
    StatsSnapshot, StoreError, ViewDelta,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const SESSION_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SESSIONS_V1: &str = r"
CREATE TABLE IF NOT EXISTS session_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  user_key TEXT NOT NULL,
  mode TEXT NOT NULL,
  exp INTEGER NOT NULL CHECK (exp >= 0),
  lv INTEGER NOT NULL CHECK (lv >= 1),
  ten_ave REAL NOT NULL CHECK (ten_ave BETWEEN 0.0 AND 1.0),
  all_ave REAL NOT NULL CHECK (all_ave BETWEEN 0.0 AND 1.0),
  sess INTEGER NOT NULL CHECK (sess >= 1),
  cst INTEGER NOT NULL CHECK (cst >= 0),
  mst INTEGER NOT NULL CHECK (mst >= 0),
  last TEXT NOT NULL,
  is_public INTEGER NOT NULL CHECK (is_public IN (0, 1)),
  recorded_at INTEGER NOT NULL,
  correct_count INTEGER NOT NULL CHECK (correct_count >= 0),
  total_count INTEGER NOT NULL CHECK (total_count >= correct_count),
  display_timestamp TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_session_log_no_update
BEFORE UPDATE ON session_log
BEGIN
  SELECT RAISE(FAIL, 'session_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_session_log_no_delete
BEFORE DELETE ON session_log
BEGIN
  SELECT RAISE(FAIL, 'session_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_session_log_identity_seq
  ON session_log(user_key, name, seq);

CREATE TABLE IF NOT EXISTS aggregate_view (
  user_key TEXT NOT NULL,
  name TEXT NOT NULL,
  is_public INTEGER NOT NULL CHECK (is_public IN (0, 1)),
  exp INTEGER NOT NULL CHECK (exp >= 0),
  total_correct INTEGER NOT NULL CHECK (total_correct >= 0),
  total_questions INTEGER NOT NULL CHECK (total_questions >= 0),
  sess INTEGER NOT NULL CHECK (sess >= 0),
  last_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (user_key, name)
);
";

const SESSION_COLUMNS: &str = "seq, name, user_key, mode, exp, lv, ten_ave, all_ave, sess, cst, mst,
     last, is_public, recorded_at, correct_count, total_count, display_timestamp";

const AGGREGATE_COLUMNS: &str =
    "user_key, name, is_public, exp, total_correct, total_questions, sess, last_at, updated_at";

pub struct SqliteQuizStore {
    conn: Connection,
}

impl SqliteQuizStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SESSIONS_V1)
            .context("failed to apply session schema")?;

        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SESSION_MIGRATION_VERSION, now],
            )
            .context("failed to register session schema migration")?;

        Ok(())
    }

    pub fn append_session(&mut self, input: &SessionInput) -> Result<SessionRecord> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start session transaction")?;

        tx.execute(
            "INSERT INTO session_log(
                name, user_key, mode, exp, lv, ten_ave, all_ave, sess, cst, mst,
                last, is_public, recorded_at, correct_count, total_count, display_timestamp
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16
             )",
            params![
                input.identity.name,
                input.identity.user_key,
                input.mode,
                sql_integer(input.snapshot.exp, "exp")?,
                sql_integer(input.snapshot.level, "lv")?,
                input.snapshot.ten_ave,
                input.snapshot.all_ave,
                sql_integer(input.snapshot.sess, "sess")?,
                i64::from(input.snapshot.cst),
                i64::from(input.snapshot.mst),
                input.snapshot.last,
                bool_to_sql(input.is_public),
                input.recorded_at,
                i64::from(input.correct_count),
                i64::from(input.total_count),
                input.display_timestamp,
            ],
        )
        .context("failed to append session record")?;

        let seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit session transaction")?;

        tracing::debug!(seq, identity = %input.identity, "session appended");
        Ok(input.clone().into_record(seq))
    }

    pub fn list_sessions_for(&self, identity: &Identity) -> Result<Vec<SessionRecord>> {
        if !table_exists(&self.conn, "session_log")? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS}
             FROM session_log
             WHERE user_key = ?1 AND name = ?2
             ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(
            params![identity.user_key, identity.name],
            parse_session_row,
        )?;

        collect_rows(rows)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        if !table_exists(&self.conn, "session_log")? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS}
             FROM session_log
             ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map([], parse_session_row)?;

        collect_rows(rows)
    }

    pub fn latest_seq(&self) -> Result<Option<i64>> {
        if !table_exists(&self.conn, "session_log")? {
            return Ok(None);
        }

        self.conn
            .query_row("SELECT MAX(seq) FROM session_log", [], |row| row.get(0))
            .context("failed to read latest session seq")
    }

    /// Read-modify-write of one view row under `BEGIN IMMEDIATE`, so upserts
    /// from other connections on the same file serialize behind it.
    pub fn upsert_aggregate(
        &mut self,
        identity: &Identity,
        delta: &ViewDelta,
        now_ms: i64,
    ) -> Result<AggregateRow> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start aggregate transaction")?;

        let existing = read_aggregate(&tx, identity)?;
        let row = merge_delta(existing.as_ref(), identity, delta, now_ms);
        write_aggregate(&tx, &row)?;

        tx.commit().context("failed to commit aggregate transaction")?;

        tracing::debug!(identity = %identity, sess = row.sess, "aggregate row upserted");
        Ok(row)
    }

    pub fn get_aggregate(&self, identity: &Identity) -> Result<Option<AggregateRow>> {
        if !table_exists(&self.conn, "aggregate_view")? {
            return Ok(None);
        }

        read_aggregate(&self.conn, identity)
    }

    pub fn list_aggregates(&self) -> Result<Vec<AggregateRow>> {
        if !table_exists(&self.conn, "aggregate_view")? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AGGREGATE_COLUMNS}
             FROM aggregate_view
             ORDER BY user_key ASC, name ASC"
        ))?;
        let rows = stmt.query_map([], parse_aggregate_row)?;

        collect_rows(rows)
    }

    /// Swaps the whole view for `rows` in one transaction.
    pub fn replace_aggregates(&mut self, rows: &[AggregateRow]) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start rebuild transaction")?;

        tx.execute("DELETE FROM aggregate_view", [])
            .context("failed to clear aggregate_view")?;
        for row in rows {
            write_aggregate(&tx, row)?;
        }

        tx.commit().context("failed to commit rebuild transaction")?;

        tracing::debug!(rows = rows.len(), "aggregate view replaced");
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl SessionLog for SqliteQuizStore {
    fn history_for(&self, identity: &Identity) -> Result<Vec<SessionRecord>, StoreError> {
        self.list_sessions_for(identity)
            .map_err(|err| store_error(&err))
    }

    fn append(&mut self, input: &SessionInput) -> Result<SessionRecord, StoreError> {
        self.append_session(input).map_err(|err| store_error(&err))
    }

    fn records(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.list_sessions().map_err(|err| store_error(&err))
    }
}

impl AggregateView for SqliteQuizStore {
    fn upsert(
        &mut self,
        identity: &Identity,
        delta: &ViewDelta,
        now_ms: i64,
    ) -> Result<AggregateRow, StoreError> {
        self.upsert_aggregate(identity, delta, now_ms)
            .map_err(|err| store_error(&err))
    }

    fn row_for(&self, identity: &Identity) -> Result<Option<AggregateRow>, StoreError> {
        self.get_aggregate(identity).map_err(|err| store_error(&err))
    }

    fn rows(&self) -> Result<Vec<AggregateRow>, StoreError> {
        self.list_aggregates().map_err(|err| store_error(&err))
    }

    fn replace_all(&mut self, rows: &[AggregateRow]) -> Result<(), StoreError> {
        self.replace_aggregates(rows)
            .map_err(|err| store_error(&err))
    }
}

/// Classifies an adapter failure for the ingestion coordinator.
///
/// Lock contention and constraint failures are write conflicts; rows that do
/// not decode are corrupt; everything else means the store is unavailable.
fn store_error(err: &anyhow::Error) -> StoreError {
    let message = format!("{err:#}");
    let cause = err
        .chain()
        .find_map(|item| item.downcast_ref::<rusqlite::Error>());

    match cause {
        Some(rusqlite::Error::SqliteFailure(failure, _)) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                StoreError::WriteConflict(message)
            }
            _ => StoreError::Unavailable(message),
        },
        Some(
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..),
        ) => StoreError::Corrupt(message),
        _ => StoreError::Unavailable(message),
    }
}

fn read_aggregate(conn: &Connection, identity: &Identity) -> Result<Option<AggregateRow>> {
    conn.query_row(
        &format!(
            "SELECT {AGGREGATE_COLUMNS}
             FROM aggregate_view
             WHERE user_key = ?1 AND name = ?2"
        ),
        params![identity.user_key, identity.name],
        parse_aggregate_row,
    )
    .optional()
    .with_context(|| format!("failed to read aggregate row for {identity}"))
}

fn write_aggregate(conn: &Connection, row: &AggregateRow) -> Result<()> {
    conn.execute(
        "INSERT INTO aggregate_view(
            user_key, name, is_public, exp, total_correct, total_questions, sess,
            last_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(user_key, name) DO UPDATE SET
           is_public = excluded.is_public,
           exp = excluded.exp,
           total_correct = excluded.total_correct,
           total_questions = excluded.total_questions,
           sess = excluded.sess,
           last_at = excluded.last_at,
           updated_at = excluded.updated_at",
        params![
            row.user_key,
            row.name,
            bool_to_sql(row.is_public),
            sql_integer(row.exp, "exp")?,
            sql_integer(row.total_correct, "total_correct")?,
            sql_integer(row.total_questions, "total_questions")?,
            sql_integer(row.sess, "sess")?,
            row.last_at,
            row.updated_at,
        ],
    )
    .with_context(|| format!("failed to write aggregate row for {}:{}", row.user_key, row.name))?;

    Ok(())
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        seq: row.get(0)?,
        identity: Identity {
            user_key: row.get(2)?,
            name: row.get(1)?,
        },
        mode: row.get(3)?,
        snapshot: StatsSnapshot {
            exp: column_u64(row, 4, "exp")?,
            level: column_u64(row, 5, "lv")?,
            ten_ave: row.get(6)?,
            all_ave: row.get(7)?,
            sess: column_u64(row, 8, "sess")?,
            cst: column_u32(row, 9, "cst")?,
            mst: column_u32(row, 10, "mst")?,
            last: row.get(11)?,
        },
        is_public: row.get::<_, i64>(12)? != 0,
        recorded_at: row.get(13)?,
        correct_count: column_u32(row, 14, "correct_count")?,
        total_count: column_u32(row, 15, "total_count")?,
        display_timestamp: row.get(16)?,
    })
}

fn parse_aggregate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AggregateRow> {
    Ok(AggregateRow {
        user_key: row.get(0)?,
        name: row.get(1)?,
        is_public: row.get::<_, i64>(2)? != 0,
        exp: column_u64(row, 3, "exp")?,
        total_correct: column_u64(row, 4, "total_correct")?,
        total_questions: column_u64(row, 5, "total_questions")?,
        sess: column_u64(row, 6, "sess")?,
        last_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn column_u64(row: &rusqlite::Row<'_>, index: usize, column: &str) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(index)?;
    u64::try_from(raw).map_err(|_| invalid_integer(index, column, raw))
}

fn column_u32(row: &rusqlite::Row<'_>, index: usize, column: &str) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(index)?;
    u32::try_from(raw).map_err(|_| invalid_integer(index, column, raw))
}

fn invalid_integer(index: usize, column: &str, raw: i64) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Integer,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {column}: {raw}"),
        )),
    )
}

fn sql_integer(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{column} {value} exceeds sqlite INTEGER range"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
