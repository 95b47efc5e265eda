//! Durable dead-letter store backed by SQLite.
//!
//! Each worker writes its own DB file named `worker{index}.sqlite3`
//! in the dead letter directory, so there is never write contention
//! between workers.

use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::DeadLetterRecord;
use super::DeadLetterWriter;
use crate::dataflow::StepId;
use crate::dataflow::WorkerCount;
use crate::dataflow::WorkerIndex;
use crate::errors::FlowException;
use crate::errors::TrackedError;

fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE dead_letters ( \
             step_id TEXT NOT NULL, \
             fingerprint INTEGER NOT NULL, \
             element BLOB NOT NULL, \
             error_message TEXT, \
             stacktrace TEXT, \
             failed_at TEXT NOT NULL, \
             occurrences INTEGER NOT NULL CHECK (occurrences > 0), \
             PRIMARY KEY (step_id, fingerprint) \
             ) STRICT",
        ),
        M::up("CREATE INDEX dead_letters_by_failed_at ON dead_letters (failed_at)"),
    ])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<(), TrackedError> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")
        .reraise("error setting journal mode")?;
    conn.pragma_update(None, "busy_timeout", "5000")
        .reraise("error setting busy timeout")?;
    get_migrations()
        .to_latest(conn)
        .reraise("error migrating dead letter DB")?;
    Ok(())
}

/// Path of the DB file for a worker within a dead letter directory.
pub fn worker_db_path(dir: &Path, index: WorkerIndex) -> PathBuf {
    dir.join(format!("worker{}.sqlite3", index.0))
}

pub struct SqliteDeadLetterStore {
    conn: Connection,
}

impl SqliteDeadLetterStore {
    /// Open or create the DB for this worker in `dir`.
    pub fn open(dir: &Path, index: WorkerIndex) -> Result<Self, TrackedError> {
        std::fs::create_dir_all(dir)
            .reraise_with(|| format!("can't create dead letter directory {dir:?}"))?;
        Self::open_file(&worker_db_path(dir, index))
    }

    /// Read back every worker's records in `dir`, in worker order.
    ///
    /// Workers that never wrote a dead letter have no DB file and are
    /// skipped.
    pub fn load_all(dir: &Path, count: WorkerCount) -> Result<Vec<DeadLetterRecord>, TrackedError> {
        let mut records = Vec::new();
        for index in count.iter() {
            let file = worker_db_path(dir, index);
            if !file.exists() {
                tracing::debug!("No dead letter DB for worker {index} at {file:?}");
                continue;
            }
            records.extend(Self::open_file(&file)?.load()?);
        }
        Ok(records)
    }

    pub fn open_file(file: &Path) -> Result<Self, TrackedError> {
        tracing::info!("Opening dead letter DB at {file:?}");
        let mut conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .reraise("can't open dead letter DB")?;
        setup_conn(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn open_mem() -> Result<Self, TrackedError> {
        let mut conn = Connection::open_in_memory().reraise("can't open in-memory DB")?;
        setup_conn(&mut conn)?;
        Ok(Self { conn })
    }

    /// All records, in the order they were first written.
    pub fn load(&self) -> Result<Vec<DeadLetterRecord>, TrackedError> {
        self.query(None)
    }

    pub fn load_step(&self, step_id: &StepId) -> Result<Vec<DeadLetterRecord>, TrackedError> {
        self.query(Some(step_id))
    }

    fn query(&self, step_id: Option<&StepId>) -> Result<Vec<DeadLetterRecord>, TrackedError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT step_id, fingerprint, element, error_message, stacktrace, \
                 failed_at, occurrences \
                 FROM dead_letters \
                 WHERE ?1 IS NULL OR step_id = ?1 \
                 ORDER BY rowid",
            )
            .reraise("error preparing dead letter query")?;
        let rows = stmt
            .query_map((step_id.map(|s| &s.0),), |row| {
                let failed_at: String = row.get(5)?;
                let failed_at = DateTime::parse_from_rfc3339(&failed_at)
                    .map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(err))
                    })?
                    .with_timezone(&Utc);
                Ok(DeadLetterRecord {
                    step_id: StepId(row.get(0)?),
                    fingerprint: row.get::<_, i64>(1)? as u64,
                    element: row.get(2)?,
                    error_message: row.get(3)?,
                    stacktrace: row.get(4)?,
                    failed_at,
                    occurrences: row.get::<_, i64>(6)? as u64,
                })
            })
            .reraise("error querying dead letters")?;
        let records = rows
            .collect::<Result<Vec<_>, _>>()
            .reraise("error unpacking dead letter row")?;
        Ok(records)
    }
}

impl DeadLetterWriter for SqliteDeadLetterStore {
    fn write_batch(&mut self, records: Vec<DeadLetterRecord>) -> Result<(), TrackedError> {
        let txn = self
            .conn
            .transaction()
            .reraise("error starting dead letter transaction")?;
        for record in records {
            tracing::trace!("Writing dead letter {record:?}");
            let DeadLetterRecord {
                step_id,
                fingerprint,
                element,
                error_message,
                stacktrace,
                failed_at,
                occurrences,
            } = record;
            txn.execute(
                "INSERT INTO dead_letters \
                 (step_id, fingerprint, element, error_message, stacktrace, failed_at, occurrences) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (step_id, fingerprint) DO UPDATE \
                 SET occurrences = occurrences + EXCLUDED.occurrences, \
                 failed_at = EXCLUDED.failed_at, \
                 error_message = EXCLUDED.error_message, \
                 stacktrace = EXCLUDED.stacktrace",
                (
                    step_id.0,
                    fingerprint as i64,
                    element,
                    error_message,
                    stacktrace,
                    failed_at.to_rfc3339(),
                    occurrences as i64,
                ),
            )
            .reraise("error writing dead letter")?;
        }
        txn.commit().reraise("error committing dead letters")
    }
}
