use std::path::{Path, PathBuf};

use chrono::Utc;
use postloop_core::db::{blob_to_vector, connect, vector_to_blob};
use postloop_core::{PostloopError, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::store::{add_in_place, PreferenceKey, PreferenceStore, WeightKey, WeightStore};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS policy_preferences (
      platform TEXT NOT NULL,
      time_bucket TEXT NOT NULL,
      day_of_week TEXT NOT NULL,
      dimension TEXT NOT NULL,
      value TEXT NOT NULL,
      preference REAL NOT NULL DEFAULT 0,
      updated_at INTEGER NOT NULL,
      PRIMARY KEY (platform, time_bucket, day_of_week, dimension, value)
    );
    CREATE TABLE IF NOT EXISTS policy_weights (
      dimension TEXT NOT NULL,
      value TEXT NOT NULL,
      weights BLOB NOT NULL,
      updated_at INTEGER NOT NULL,
      PRIMARY KEY (dimension, value)
    );
";

fn conn(path: &Path) -> Result<Connection> {
    let c = connect(path)?;
    c.execute_batch(SCHEMA)?;
    Ok(c)
}

/// Policy cells in SQLite. One upsert per update, so concurrent writers
/// never lose an increment.
#[derive(Debug, Clone)]
pub struct SqlitePreferenceStore {
    db_path: PathBuf,
}

impl SqlitePreferenceStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        conn(&db_path)?;
        Ok(Self { db_path })
    }
}

impl PreferenceStore for SqlitePreferenceStore {
    fn preference(&self, key: &PreferenceKey<'_>) -> Result<Option<f64>> {
        let c = connect(&self.db_path)?;
        let value = c
            .query_row(
                "SELECT preference FROM policy_preferences
                 WHERE platform=?1 AND time_bucket=?2 AND day_of_week=?3 AND dimension=?4 AND value=?5",
                params![
                    key.platform,
                    key.time_bucket,
                    key.day_of_week,
                    key.dimension.as_str(),
                    key.value
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn update(&self, key: &PreferenceKey<'_>, delta: f64) -> Result<f64> {
        let c = connect(&self.db_path)?;
        let now = Utc::now().timestamp();
        let value = c.query_row(
            "INSERT INTO policy_preferences(platform, time_bucket, day_of_week, dimension, value, preference, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(platform, time_bucket, day_of_week, dimension, value)
             DO UPDATE SET preference = preference + excluded.preference, updated_at = excluded.updated_at
             RETURNING preference",
            params![
                key.platform,
                key.time_bucket,
                key.day_of_week,
                key.dimension.as_str(),
                key.value,
                delta,
                now
            ],
            |row| row.get(0),
        )?;
        Ok(value)
    }
}

/// Weight vectors in SQLite, stored as little-endian f32 blobs. Updates run
/// in an IMMEDIATE transaction, which takes the write lock before reading.
#[derive(Debug, Clone)]
pub struct SqliteWeightStore {
    db_path: PathBuf,
}

impl SqliteWeightStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        conn(&db_path)?;
        Ok(Self { db_path })
    }
}

impl WeightStore for SqliteWeightStore {
    fn weights(&self, key: &WeightKey<'_>) -> Result<Option<Vec<f32>>> {
        let c = connect(&self.db_path)?;
        let blob: Option<Vec<u8>> = c
            .query_row(
                "SELECT weights FROM policy_weights WHERE dimension=?1 AND value=?2",
                params![key.dimension.as_str(), key.value],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|b| blob_to_vector(&b)).transpose()
    }

    fn update(&self, key: &WeightKey<'_>, delta: &[f32]) -> Result<()> {
        let mut c = connect(&self.db_path)?;
        let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let blob: Option<Vec<u8>> = tx
            .query_row(
                "SELECT weights FROM policy_weights WHERE dimension=?1 AND value=?2",
                params![key.dimension.as_str(), key.value],
                |row| row.get(0),
            )
            .optional()?;
        let mut stored = match blob {
            Some(b) => blob_to_vector(&b)?,
            None => vec![0.0; delta.len()],
        };
        add_in_place(&mut stored, delta, key)?;
        tx.execute(
            "INSERT INTO policy_weights(dimension, value, weights, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(dimension, value) DO UPDATE SET weights=excluded.weights, updated_at=excluded.updated_at",
            params![
                key.dimension.as_str(),
                key.value,
                vector_to_blob(&stored),
                Utc::now().timestamp()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Flat view of the learned state, for inspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub preferences: Vec<PreferenceRow>,
    pub weight_norms: Vec<WeightNorm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceRow {
    pub platform: String,
    pub time_bucket: String,
    pub day_of_week: String,
    pub dimension: String,
    pub value: String,
    pub preference: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightNorm {
    pub dimension: String,
    pub value: String,
    pub norm: f64,
}

fn read_snapshot(db_path: &Path, platform: Option<&str>) -> Result<PolicySnapshot> {
    let c = conn(db_path)?;
    let mut stmt = c.prepare(
        "SELECT platform, time_bucket, day_of_week, dimension, value, preference
         FROM policy_preferences
         WHERE ?1 IS NULL OR platform = ?1
         ORDER BY platform, time_bucket, day_of_week, dimension, preference DESC",
    )?;
    let preferences = stmt
        .query_map(params![platform], |row| {
            Ok(PreferenceRow {
                platform: row.get(0)?,
                time_bucket: row.get(1)?,
                day_of_week: row.get(2)?,
                dimension: row.get(3)?,
                value: row.get(4)?,
                preference: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = c.prepare("SELECT dimension, value, weights FROM policy_weights ORDER BY dimension, value")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let weight_norms = rows
        .into_iter()
        .map(|(dimension, value, blob)| {
            let w = blob_to_vector(&blob)?;
            let norm = w.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
            Ok(WeightNorm {
                dimension,
                value,
                norm,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PolicySnapshot {
        preferences,
        weight_norms,
    })
}

/// Reads the learned state, optionally restricted to one platform.
/// Async wrapper around blocking SQLite calls.
pub async fn load_snapshot(db_path: PathBuf, platform: Option<String>) -> Result<PolicySnapshot> {
    tokio::task::spawn_blocking(move || read_snapshot(&db_path, platform.as_deref()))
        .await
        .map_err(|err| PostloopError::Io(std::io::Error::other(format!("spawn_blocking join failed: {err}"))))?
}
