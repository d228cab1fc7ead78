//! Records linking generated posts to the decisions and rewards behind them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use policy::{Action, ContextBuilder, PolicyContext};
use postloop_core::db::{blob_to_vector, connect, format_ts, parse_ts, vector_to_blob};
use postloop_core::{PostloopError, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS action_records (
      post_id TEXT PRIMARY KEY,
      profile_id TEXT NOT NULL,
      platform TEXT NOT NULL,
      time_bucket TEXT NOT NULL,
      day_of_week TEXT NOT NULL,
      topic TEXT NOT NULL,
      action TEXT NOT NULL,
      business_embedding BLOB NOT NULL,
      topic_embedding BLOB NOT NULL,
      created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS post_records (
      post_id TEXT PRIMARY KEY,
      business_id TEXT NOT NULL,
      platform TEXT NOT NULL,
      topic TEXT NOT NULL,
      caption TEXT NOT NULL,
      image_ref TEXT,
      created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS reward_records (
      post_id TEXT PRIMARY KEY,
      platform TEXT NOT NULL,
      reward REAL NOT NULL,
      baseline_at_computation REAL NOT NULL,
      created_at TEXT NOT NULL,
      policy_applied_at TEXT
    );
    CREATE TABLE IF NOT EXISTS platform_baselines (
      platform TEXT PRIMARY KEY,
      baseline REAL NOT NULL,
      samples INTEGER NOT NULL,
      updated_at TEXT NOT NULL
    );
";

/// Everything needed to rebuild the context a decision was made in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub post_id: String,
    pub profile_id: String,
    pub platform: String,
    pub time_bucket: String,
    pub day_of_week: String,
    pub topic: String,
    pub action: Action,
    pub business_embedding: Vec<f32>,
    pub topic_embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl ActionRecord {
    pub fn context(&self, builder: &ContextBuilder) -> Result<PolicyContext> {
        builder.build(
            &self.platform,
            &self.time_bucket,
            &self.day_of_week,
            Some(self.business_embedding.as_slice()),
            Some(self.topic_embedding.as_slice()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub post_id: String,
    pub business_id: String,
    pub platform: String,
    pub topic: String,
    pub caption: String,
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub post_id: String,
    pub platform: String,
    pub reward: f64,
    /// Platform baseline just before this reward was folded in.
    pub baseline_at_computation: f64,
    pub created_at: DateTime<Utc>,
    pub policy_applied_at: Option<DateTime<Utc>>,
}

impl RewardRecord {
    pub fn advantage(&self) -> f64 {
        self.reward - self.baseline_at_computation
    }
}

/// Result of [`Ledger::record_reward`].
#[derive(Debug, Clone, PartialEq)]
pub enum RewardEntry {
    /// This call created the record and moved the baseline.
    Created(RewardRecord),
    /// A record already existed; nothing changed.
    Existing(RewardRecord),
}

impl RewardEntry {
    pub fn record(&self) -> &RewardRecord {
        match self {
            RewardEntry::Created(r) | RewardEntry::Existing(r) => r,
        }
    }
}

/// One exponential moving average step.
pub fn ema(baseline: f64, reward: f64, beta: f64) -> f64 {
    (1.0 - beta) * baseline + beta * reward
}

pub trait Ledger: Send + Sync {
    /// Replaces any earlier record for the same post.
    fn record_action(&self, record: &ActionRecord) -> Result<()>;
    fn action(&self, post_id: &str) -> Result<Option<ActionRecord>>;

    fn record_post(&self, record: &PostRecord) -> Result<()>;
    fn post(&self, post_id: &str) -> Result<Option<PostRecord>>;

    fn reward(&self, post_id: &str) -> Result<Option<RewardRecord>>;

    /// Stores the reward for `post_id` and advances the platform baseline in
    /// one transaction. A second call for the same post changes nothing.
    fn record_reward(
        &self,
        post_id: &str,
        platform: &str,
        reward: f64,
        beta: f64,
    ) -> Result<RewardEntry>;

    /// Current baseline, `None` before the first reward on `platform`.
    fn baseline(&self, platform: &str) -> Result<Option<f64>>;

    /// Sets `policy_applied_at`. Returns false if it was already set.
    fn mark_applied(&self, post_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct SqliteLedger {
    db_path: PathBuf,
}

impl SqliteLedger {
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

fn read_reward(c: &Connection, post_id: &str) -> Result<Option<RewardRecord>> {
    let raw: Option<(String, String, f64, f64, String, Option<String>)> = c
        .query_row(
            "SELECT post_id, platform, reward, baseline_at_computation, created_at, policy_applied_at
             FROM reward_records WHERE post_id = ?1",
            params![post_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;
    raw.map(|(post_id, platform, reward, baseline, created_at, applied)| {
        Ok(RewardRecord {
            post_id,
            platform,
            reward,
            baseline_at_computation: baseline,
            created_at: parse_ts(&created_at)?,
            policy_applied_at: applied.as_deref().map(parse_ts).transpose()?,
        })
    })
    .transpose()
}

impl Ledger for SqliteLedger {
    fn record_action(&self, record: &ActionRecord) -> Result<()> {
        let c = connect(&self.db_path)?;
        c.execute(
            "INSERT OR REPLACE INTO action_records(
               post_id, profile_id, platform, time_bucket, day_of_week, topic, action,
               business_embedding, topic_embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.post_id,
                record.profile_id,
                record.platform,
                record.time_bucket,
                record.day_of_week,
                record.topic,
                serde_json::to_string(&record.action)?,
                vector_to_blob(&record.business_embedding),
                vector_to_blob(&record.topic_embedding),
                format_ts(record.created_at)
            ],
        )?;
        Ok(())
    }

    fn action(&self, post_id: &str) -> Result<Option<ActionRecord>> {
        let c = connect(&self.db_path)?;
        type Raw = (
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            Vec<u8>,
            Vec<u8>,
            String,
        );
        let raw: Option<Raw> = c
            .query_row(
                "SELECT post_id, profile_id, platform, time_bucket, day_of_week, topic, action,
                        business_embedding, topic_embedding, created_at
                 FROM action_records WHERE post_id = ?1",
                params![post_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                    ))
                },
            )
            .optional()?;
        let Some((post_id, profile_id, platform, time_bucket, day_of_week, topic, action, business, topic_blob, created_at)) = raw
        else {
            return Ok(None);
        };
        let action: Action = serde_json::from_str(&action).map_err(|err| {
            PostloopError::DataIntegrity(format!("action record {post_id} is unreadable: {err}"))
        })?;
        Ok(Some(ActionRecord {
            post_id,
            profile_id,
            platform,
            time_bucket,
            day_of_week,
            topic,
            action,
            business_embedding: blob_to_vector(&business)?,
            topic_embedding: blob_to_vector(&topic_blob)?,
            created_at: parse_ts(&created_at)?,
        }))
    }

    fn record_post(&self, record: &PostRecord) -> Result<()> {
        let c = connect(&self.db_path)?;
        c.execute(
            "INSERT OR REPLACE INTO post_records(post_id, business_id, platform, topic, caption, image_ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.post_id,
                record.business_id,
                record.platform,
                record.topic,
                record.caption,
                record.image_ref,
                format_ts(record.created_at)
            ],
        )?;
        Ok(())
    }

    fn post(&self, post_id: &str) -> Result<Option<PostRecord>> {
        let c = connect(&self.db_path)?;
        let raw: Option<(String, String, String, String, String, Option<String>, String)> = c
            .query_row(
                "SELECT post_id, business_id, platform, topic, caption, image_ref, created_at
                 FROM post_records WHERE post_id = ?1",
                params![post_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;
        raw.map(|(post_id, business_id, platform, topic, caption, image_ref, created_at)| {
            Ok(PostRecord {
                post_id,
                business_id,
                platform,
                topic,
                caption,
                image_ref,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    fn reward(&self, post_id: &str) -> Result<Option<RewardRecord>> {
        let c = connect(&self.db_path)?;
        read_reward(&c, post_id)
    }

    fn record_reward(
        &self,
        post_id: &str,
        platform: &str,
        reward: f64,
        beta: f64,
    ) -> Result<RewardEntry> {
        let mut c = connect(&self.db_path)?;
        let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = read_reward(&tx, post_id)? {
            return Ok(RewardEntry::Existing(existing));
        }

        let before: f64 = tx
            .query_row(
                "SELECT baseline FROM platform_baselines WHERE platform = ?1",
                params![platform],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0.0);
        let after = ema(before, reward, beta);
        let now = Utc::now();

        tx.execute(
            "INSERT INTO reward_records(post_id, platform, reward, baseline_at_computation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![post_id, platform, reward, before, format_ts(now)],
        )?;
        tx.execute(
            "INSERT INTO platform_baselines(platform, baseline, samples, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(platform) DO UPDATE SET
               baseline = excluded.baseline, samples = samples + 1, updated_at = excluded.updated_at",
            params![platform, after, format_ts(now)],
        )?;
        tx.commit()?;

        Ok(RewardEntry::Created(RewardRecord {
            post_id: post_id.to_string(),
            platform: platform.to_string(),
            reward,
            baseline_at_computation: before,
            created_at: parse_ts(&format_ts(now))?,
            policy_applied_at: None,
        }))
    }

    fn baseline(&self, platform: &str) -> Result<Option<f64>> {
        let c = connect(&self.db_path)?;
        let value = c
            .query_row(
                "SELECT baseline FROM platform_baselines WHERE platform = ?1",
                params![platform],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn mark_applied(&self, post_id: &str) -> Result<bool> {
        let c = connect(&self.db_path)?;
        let changed = c.execute(
            "UPDATE reward_records SET policy_applied_at = ?2
             WHERE post_id = ?1 AND policy_applied_at IS NULL",
            params![post_id, format_ts(Utc::now())],
        )?;
        Ok(changed == 1)
    }
}
