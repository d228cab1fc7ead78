//! Persistent job queue.
//!
//! Every state transition is a single conditional `UPDATE`, so several worker
//! processes can share one database without running a job twice.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use postloop_core::db::{connect, format_ts, parse_ts};
use postloop_core::{PostloopError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::job::{Job, JobStatus, NewJob};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS jobs (
      job_id TEXT PRIMARY KEY,
      job_type TEXT NOT NULL,
      payload TEXT NOT NULL,
      status TEXT NOT NULL,
      run_at TEXT NOT NULL,
      retry_count INTEGER NOT NULL DEFAULT 0,
      result TEXT,
      last_error TEXT,
      created_at TEXT NOT NULL,
      started_at TEXT,
      completed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, run_at);
";

const COLUMNS: &str = "job_id, job_type, payload, status, run_at, retry_count, result, last_error, created_at, started_at, completed_at";

pub trait JobStore: Send + Sync {
    /// Inserts `job` unless a job with the same id exists. Returns whether a
    /// row was written.
    fn enqueue(&self, job: &NewJob) -> Result<bool>;

    /// Up to `limit` queued jobs whose `run_at` is not after `now`.
    fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// `queued -> running`, stamping `started_at = now`. Returns false if
    /// another worker got there first.
    fn claim(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Puts jobs that have been `running` since before `stale_before` back in
    /// the queue, spending one retry each like [`JobStore::fail`]. Returns
    /// `(job_id, job_type)` of every job requeued or, with the budget spent,
    /// failed.
    fn requeue_stale(&self, stale_before: DateTime<Utc>, max_retries: u32) -> Result<Vec<(String, String)>>;

    /// `running -> completed`.
    fn complete(&self, job_id: &str, result: &Value) -> Result<()>;

    /// Spends one retry. Returns the resulting status: `queued` while retries
    /// remain, `failed` once `retry_count` reaches `max_retries`.
    fn fail(&self, job_id: &str, error: &str, max_retries: u32) -> Result<JobStatus>;

    /// `running -> failed` without touching the retry budget.
    fn fail_permanently(&self, job_id: &str, error: &str) -> Result<()>;

    fn get(&self, job_id: &str) -> Result<Option<Job>>;

    /// Most recently created jobs first.
    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>>;
}

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

impl SqliteJobStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        conn(&db_path)?;
        Ok(Self { db_path })
    }
}

fn conn(path: &Path) -> Result<Connection> {
    let c = connect(path)?;
    c.execute_batch(SCHEMA)?;
    Ok(c)
}

struct RawJob {
    job_id: String,
    job_type: String,
    payload: String,
    status: String,
    run_at: String,
    retry_count: u32,
    result: Option<String>,
    last_error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            job_type: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            run_at: row.get(4)?,
            retry_count: row.get(5)?,
            result: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        // A payload that is not JSON at all is kept as a string so the worker
        // can reject that one job as malformed.
        let payload = serde_json::from_str(&self.payload).unwrap_or(Value::String(self.payload));
        Ok(Job {
            job_id: self.job_id,
            job_type: self.job_type,
            payload,
            status: self.status.parse()?,
            run_at: parse_ts(&self.run_at)?,
            retry_count: self.retry_count,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn query_jobs(c: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
    let mut stmt = c.prepare(sql)?;
    let raws = stmt
        .query_map(params, RawJob::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(RawJob::into_job).collect()
}

fn not_running(job_id: &str) -> PostloopError {
    PostloopError::DataIntegrity(format!("job {job_id} is not running"))
}

impl JobStore for SqliteJobStore {
    fn enqueue(&self, job: &NewJob) -> Result<bool> {
        let c = connect(&self.db_path)?;
        let payload = serde_json::to_string(&job.payload_fields()?)?;
        let inserted = c.execute(
            "INSERT INTO jobs(job_id, job_type, payload, status, run_at, retry_count, created_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, 0, ?5)
             ON CONFLICT(job_id) DO NOTHING",
            params![
                job.job_id,
                job.job_type(),
                payload,
                format_ts(job.run_at),
                format_ts(Utc::now())
            ],
        )?;
        Ok(inserted == 1)
    }

    fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let c = connect(&self.db_path)?;
        query_jobs(
            &c,
            &format!(
                "SELECT {COLUMNS} FROM jobs WHERE status = 'queued' AND run_at <= ?1
                 ORDER BY run_at LIMIT ?2"
            ),
            params![format_ts(now), limit as i64],
        )
    }

    fn claim(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let c = connect(&self.db_path)?;
        let changed = c.execute(
            "UPDATE jobs SET status = 'running', started_at = ?2
             WHERE job_id = ?1 AND status = 'queued'",
            params![job_id, format_ts(now)],
        )?;
        Ok(changed == 1)
    }

    fn requeue_stale(&self, stale_before: DateTime<Utc>, max_retries: u32) -> Result<Vec<(String, String)>> {
        let c = connect(&self.db_path)?;
        let mut stmt = c.prepare(
            "UPDATE jobs SET
               retry_count = retry_count + 1,
               last_error = 'claim expired before the job finished',
               status = CASE WHEN retry_count + 1 >= ?2 THEN 'failed' ELSE 'queued' END,
               completed_at = CASE WHEN retry_count + 1 >= ?2 THEN ?3 ELSE NULL END
             WHERE status = 'running' AND started_at <= ?1
             RETURNING job_id, job_type",
        )?;
        let ids = stmt
            .query_map(
                params![format_ts(stale_before), max_retries, format_ts(Utc::now())],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
        Ok(ids)
    }

    fn complete(&self, job_id: &str, result: &Value) -> Result<()> {
        let c = connect(&self.db_path)?;
        let changed = c.execute(
            "UPDATE jobs SET status = 'completed', result = ?2, completed_at = ?3
             WHERE job_id = ?1 AND status = 'running'",
            params![job_id, serde_json::to_string(result)?, format_ts(Utc::now())],
        )?;
        if changed == 0 {
            return Err(not_running(job_id));
        }
        Ok(())
    }

    fn fail(&self, job_id: &str, error: &str, max_retries: u32) -> Result<JobStatus> {
        let c = connect(&self.db_path)?;
        // SET expressions all see the pre-update row.
        let status: Option<String> = c
            .query_row(
                "UPDATE jobs SET
                   retry_count = retry_count + 1,
                   last_error = ?2,
                   status = CASE WHEN retry_count + 1 >= ?3 THEN 'failed' ELSE 'queued' END,
                   completed_at = CASE WHEN retry_count + 1 >= ?3 THEN ?4 ELSE NULL END
                 WHERE job_id = ?1 AND status = 'running'
                 RETURNING status",
                params![job_id, error, max_retries, format_ts(Utc::now())],
                |row| row.get(0),
            )
            .optional()?;
        status.ok_or_else(|| not_running(job_id))?.parse()
    }

    fn fail_permanently(&self, job_id: &str, error: &str) -> Result<()> {
        let c = connect(&self.db_path)?;
        let changed = c.execute(
            "UPDATE jobs SET status = 'failed', last_error = ?2, completed_at = ?3
             WHERE job_id = ?1 AND status = 'running'",
            params![job_id, error, format_ts(Utc::now())],
        )?;
        if changed == 0 {
            return Err(not_running(job_id));
        }
        Ok(())
    }

    fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let c = connect(&self.db_path)?;
        let raw = c
            .query_row(
                &format!("SELECT {COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![job_id],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let c = connect(&self.db_path)?;
        query_jobs(
            &c,
            &format!(
                "SELECT {COLUMNS} FROM jobs WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at DESC, job_id LIMIT ?2"
            ),
            params![status.map(JobStatus::as_str), limit as i64],
        )
    }
}
