//! SQLite plumbing shared by the persistent stores.
//!
//! Every store opens a fresh connection per operation (cheap for SQLite and
//! safe across worker processes) and creates its own tables on open.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{PostloopError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Base directory for state and event logs: `$POSTLOOP_DATA` or `~/.postloop`.
pub fn data_dir() -> PathBuf {
    match std::env::var("POSTLOOP_DATA") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => {
            let home = dirs::home_dir().unwrap_or_else(|| ".".into());
            home.join(".postloop")
        }
    }
}

pub fn db_path(custom: Option<PathBuf>) -> PathBuf {
    custom.unwrap_or_else(|| data_dir().join("state").join("postloop.db"))
}

/// Opens `path`, creating the parent directory and enabling WAL.
pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    Ok(conn)
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| PostloopError::DataIntegrity(format!("bad timestamp '{raw}': {err}")))
}

pub fn vector_to_blob(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_vector(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(PostloopError::DataIntegrity(format!(
            "vector blob of {} bytes is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
