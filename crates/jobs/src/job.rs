//! Job records and the typed payloads carried through the queue.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use postloop_core::{PostloopError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PostloopError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PostloopError::DataIntegrity(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Work items understood by the worker, tagged by `job_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobPayload {
    RewardCalculation {
        profile_id: String,
        post_id: String,
        platform: String,
        /// Number of earlier polls that found no metrics yet.
        #[serde(default)]
        attempt: u32,
    },
    RlUpdate {
        profile_id: String,
        post_id: String,
        platform: String,
        reward_value: f64,
    },
    ContentGeneration {
        business_id: String,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> &'static str {
        match self {
            JobPayload::RewardCalculation { .. } => "reward_calculation",
            JobPayload::RlUpdate { .. } => "rl_update",
            JobPayload::ContentGeneration { .. } => "content_generation",
        }
    }
}

/// A persisted job row.
///
/// The payload stays raw JSON until [`Job::decode`], so an unknown job type
/// surfaces as a per-job error instead of breaking the whole batch read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    pub retry_count: u32,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn decode(&self) -> Result<JobPayload> {
        let mut payload = match &self.payload {
            Value::Object(map) => map.clone(),
            other => {
                return Err(PostloopError::MalformedJob(format!(
                    "job {} payload is not an object: {other}",
                    self.job_id
                )))
            }
        };
        payload.insert("job_type".into(), Value::String(self.job_type.clone()));
        serde_json::from_value(Value::Object(payload)).map_err(|err| {
            PostloopError::MalformedJob(format!(
                "job {} ({}) has an undecodable payload: {err}",
                self.job_id, self.job_type
            ))
        })
    }
}

/// A job about to be enqueued. Ids are deterministic per unit of work so
/// that scheduling the same follow-up twice inserts it only once.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_id: String,
    pub payload: JobPayload,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    pub fn reward_calculation(
        profile_id: &str,
        post_id: &str,
        platform: &str,
        attempt: u32,
        run_at: DateTime<Utc>,
    ) -> Self {
        let job_id = if attempt == 0 {
            format!("reward_{post_id}")
        } else {
            format!("reward_{post_id}_{attempt}")
        };
        Self {
            job_id,
            payload: JobPayload::RewardCalculation {
                profile_id: profile_id.to_string(),
                post_id: post_id.to_string(),
                platform: platform.to_string(),
                attempt,
            },
            run_at,
        }
    }

    pub fn rl_update(
        profile_id: &str,
        post_id: &str,
        platform: &str,
        reward_value: f64,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: format!("rl_{post_id}"),
            payload: JobPayload::RlUpdate {
                profile_id: profile_id.to_string(),
                post_id: post_id.to_string(),
                platform: platform.to_string(),
                reward_value,
            },
            run_at,
        }
    }

    /// `local_date` is the business-local day the content is meant for.
    pub fn content_generation(business_id: &str, local_date: NaiveDate, run_at: DateTime<Utc>) -> Self {
        Self {
            job_id: format!("content_gen_{business_id}_{}", local_date.format("%Y-%m-%d")),
            payload: JobPayload::ContentGeneration {
                business_id: business_id.to_string(),
            },
            run_at,
        }
    }

    pub fn job_type(&self) -> &'static str {
        self.payload.job_type()
    }

    /// Payload fields without the `job_type` tag, as stored in the row.
    pub fn payload_fields(&self) -> Result<Value> {
        let mut value = serde_json::to_value(&self.payload)?;
        if let Value::Object(map) = &mut value {
            map.remove("job_type");
        }
        Ok(value)
    }
}
