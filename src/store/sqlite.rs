//! SQLite job store

use super::traits::{JobStore, OpenStore, StatusCounts, StorageError, StorageResult};
use crate::queue::{ExtractionJob, JobId, JobStatus, JobUpdate};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed job store
///
/// Jobs are stored as JSON with the fields the queue filters on (status,
/// timestamps) duplicated into columns. Token usage is an append-only
/// ledger. Thread-safe via internal mutex on the connection.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                estimated_cost INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                job_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status
                ON jobs(status, created_at);

            CREATE TABLE IF NOT EXISTS token_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                tokens INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_token_usage_recorded
                ON token_usage(recorded_at);

            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_job(conn: &Connection, job: &ExtractionJob) -> StorageResult<()> {
        conn.execute(
            "INSERT OR REPLACE INTO jobs
                (id, status, priority, estimated_cost, created_at, updated_at, job_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id.to_string(),
                job.status.as_str(),
                job.priority.as_str(),
                job.estimated_cost as i64,
                job.created_at.timestamp_millis(),
                job.updated_at.timestamp_millis(),
                serde_json::to_string(job)?,
            ],
        )?;
        Ok(())
    }

    fn read_job(conn: &Connection, id: &JobId) -> StorageResult<Option<ExtractionJob>> {
        let json: Option<String> = conn
            .query_row(
                "SELECT job_json FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StorageError::from))
            .transpose()
    }

    fn query_jobs(
        conn: &Connection,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> StorageResult<Vec<ExtractionJob>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| row.get::<_, String>(0))?;
        let mut jobs = Vec::new();
        for json in rows {
            jobs.push(serde_json::from_str(&json?)?);
        }
        Ok(jobs)
    }
}

/// Convert a stored millisecond timestamp back to UTC
pub(crate) fn from_millis(millis: i64) -> StorageResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StorageError::DateParse(format!("invalid timestamp: {}", millis)))
}

impl OpenStore for SqliteJobStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, job: &ExtractionJob) -> StorageResult<()> {
        let conn = self.lock();
        Self::write_job(&conn, job)
    }

    fn get_job(&self, id: &JobId) -> StorageResult<Option<ExtractionJob>> {
        let conn = self.lock();
        Self::read_job(&conn, id)
    }

    fn update_job_status(
        &self,
        id: &JobId,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> StorageResult<ExtractionJob> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut job = Self::read_job(&tx, id)?.ok_or(StorageError::JobNotFound(*id))?;
        job.apply(update, now)?;
        Self::write_job(&tx, &job)?;
        tx.commit()?;
        Ok(job)
    }

    fn list_jobs_by_status(&self, status: JobStatus) -> StorageResult<Vec<ExtractionJob>> {
        let conn = self.lock();
        Self::query_jobs(
            &conn,
            "SELECT job_json FROM jobs WHERE status = ?1 ORDER BY created_at, id",
            params![status.as_str()],
        )
    }

    fn list_jobs(&self) -> StorageResult<Vec<ExtractionJob>> {
        let conn = self.lock();
        Self::query_jobs(&conn, "SELECT job_json FROM jobs ORDER BY created_at, id", [])
    }

    fn count_by_status(&self) -> StorageResult<StatusCounts> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = count as usize;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => counts.pending = count,
                Ok(JobStatus::Processing) => counts.processing = count,
                Ok(JobStatus::Completed) => counts.completed = count,
                Ok(JobStatus::Failed) => counts.failed = count,
                Err(e) => tracing::warn!(error = %e, "skipping unknown status in job store"),
            }
        }
        Ok(counts)
    }

    fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        conn.execute(
            "DELETE FROM token_usage WHERE recorded_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }

    fn record_resource_usage(
        &self,
        job_id: &JobId,
        tokens: u64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO token_usage (job_id, tokens, recorded_at) VALUES (?1, ?2, ?3)",
            params![job_id.to_string(), tokens as i64, at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn usage_since(&self, since: DateTime<Utc>) -> StorageResult<u64> {
        let conn = self.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(tokens), 0) FROM token_usage WHERE recorded_at >= ?1",
            params![since.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    fn usage_entries_since(&self, since: DateTime<Utc>) -> StorageResult<Vec<(DateTime<Utc>, u64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT recorded_at, tokens FROM token_usage
             WHERE recorded_at >= ?1 ORDER BY recorded_at, id",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (millis, tokens) = row?;
            entries.push((from_millis(millis)?, tokens.max(0) as u64));
        }
        Ok(entries)
    }
}
