//! One polling pass over the job queue.
//!
//! Meant to be started periodically (cron or similar). A pass fetches one
//! bounded batch, runs the jobs one after another and returns.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use policy::utils::events::EventLog;
use policy::utils::policy_store::{SqlitePreferenceStore, SqliteWeightStore};
use policy::{ContextBuilder, LearningRates, PolicyEngine, PreferenceStore, WeightStore};
use postloop_core::config::Queue;
use postloop_core::{PostloopError, Result, Settings};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::collaborators::Collaborators;
use crate::cycle::ContentCycle;
use crate::job::{Job, JobPayload, JobStatus, NewJob};
use crate::ledger::{Ledger, SqliteLedger};
use crate::metrics::WorkerMetrics;
use crate::queue::{JobStore, SqliteJobStore};
use crate::reward::{RewardOutcome, RewardPipeline, UpdateOutcome};

/// Stores and collaborators a worker is assembled from.
pub struct Services {
    pub jobs: Arc<dyn JobStore>,
    pub ledger: Arc<dyn Ledger>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub weights: Arc<dyn WeightStore>,
    pub collaborators: Collaborators,
    pub events: EventLog,
}

impl Services {
    /// All stores backed by the one SQLite file at `db_path`.
    pub fn sqlite(db_path: &Path, collaborators: Collaborators, events: EventLog) -> Result<Self> {
        Ok(Self {
            jobs: Arc::new(SqliteJobStore::open(db_path)?),
            ledger: Arc::new(SqliteLedger::open(db_path)?),
            preferences: Arc::new(SqlitePreferenceStore::open(db_path)?),
            weights: Arc::new(SqliteWeightStore::open(db_path)?),
            collaborators,
            events,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Orphaned `running` jobs put back before fetching.
    pub requeued: usize,
    pub fetched: usize,
    pub claimed: usize,
    pub completed: usize,
    /// Failed attempts that went back to `queued`.
    pub retried: usize,
    pub failed: usize,
    /// Jobs another worker claimed first.
    pub lost_claims: usize,
}

pub struct Worker {
    jobs: Arc<dyn JobStore>,
    rewards: RewardPipeline,
    cycle: ContentCycle,
    queue: Queue,
    metrics: WorkerMetrics,
}

impl Worker {
    pub fn new(services: Services, settings: &Settings) -> Self {
        let engine = PolicyEngine::new(
            services.preferences,
            services.weights,
            LearningRates {
                discrete: settings.learning.lr_discrete,
                continuous: settings.learning.lr_continuous,
            },
        );
        let builder = ContextBuilder::new(settings.embeddings.dim);
        let rewards = RewardPipeline::new(
            services.ledger.clone(),
            services.collaborators.rewards.clone(),
            engine.clone(),
            builder,
            settings.learning.baseline_beta,
        )
        .with_events(services.events.clone());
        let cycle = ContentCycle::new(
            services.collaborators,
            services.ledger,
            services.jobs.clone(),
            engine,
            builder,
            settings.scheduling.clone(),
            settings.queue.reward_delay_secs,
            services.events,
        );
        Self {
            jobs: services.jobs,
            rewards,
            cycle,
            queue: settings.queue.clone(),
            metrics: WorkerMetrics::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.cycle = self.cycle.with_seed(seed);
        self
    }

    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub async fn run_once(&self) -> Result<BatchReport> {
        self.run_once_at(Utc::now()).await
    }

    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        let requeued = self.requeue_stale(now)?;
        let due = self.jobs.fetch_due(now, self.queue.batch_size)?;
        let mut report = BatchReport {
            requeued,
            fetched: due.len(),
            ..BatchReport::default()
        };
        if due.is_empty() {
            debug!("no due jobs");
            return Ok(report);
        }
        info!(count = due.len(), "processing due jobs");

        for job in due {
            match self.jobs.claim(&job.job_id, now) {
                Ok(true) => report.claimed += 1,
                Ok(false) => {
                    debug!(job_id = %job.job_id, "claimed by another worker");
                    report.lost_claims += 1;
                    self.metrics.record_job(&job.job_type, "lost_claim");
                    continue;
                }
                Err(err) => {
                    error!(job_id = %job.job_id, error = %err, "claim failed");
                    continue;
                }
            }

            let outcome = self.process(&job, now).await;
            if let Err(err) = self.settle(&job, outcome, &mut report) {
                error!(job_id = %job.job_id, error = %err, "could not record job outcome");
            }
        }

        info!(
            requeued = report.requeued,
            fetched = report.fetched,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            lost_claims = report.lost_claims,
            "batch finished"
        );
        Ok(report)
    }

    /// Jobs whose worker died between claim and settle.
    fn requeue_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let lease = i64::try_from(self.queue.claim_lease_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(Duration::zero);
        let stale_before = now - lease;
        let ids = self.jobs.requeue_stale(stale_before, self.queue.max_retries)?;
        for (job_id, job_type) in &ids {
            warn!(job_id = %job_id, stale_before = %stale_before, "claim expired, job requeued");
            self.metrics.record_job(job_type, "expired_claim");
        }
        Ok(ids.len())
    }

    fn settle(&self, job: &Job, outcome: Result<Value>, report: &mut BatchReport) -> Result<()> {
        match outcome {
            Ok(result) => {
                self.jobs.complete(&job.job_id, &result)?;
                report.completed += 1;
                self.metrics.record_job(&job.job_type, "completed");
                info!(job_id = %job.job_id, job_type = %job.job_type, "job completed");
            }
            Err(err) if err.is_retryable() => {
                let status = self
                    .jobs
                    .fail(&job.job_id, &err.to_string(), self.queue.max_retries)?;
                if status == JobStatus::Failed {
                    report.failed += 1;
                    self.metrics.record_job(&job.job_type, "failed");
                    error!(job_id = %job.job_id, error = %err, "job failed, retries exhausted");
                } else {
                    report.retried += 1;
                    self.metrics.record_job(&job.job_type, "retried");
                    warn!(job_id = %job.job_id, retry = job.retry_count + 1, error = %err, "job failed, will retry");
                }
            }
            Err(err) => {
                self.jobs.fail_permanently(&job.job_id, &err.to_string())?;
                report.failed += 1;
                self.metrics.record_job(&job.job_type, "failed");
                error!(job_id = %job.job_id, error = %err, "job failed permanently");
            }
        }
        Ok(())
    }

    async fn process(&self, job: &Job, now: DateTime<Utc>) -> Result<Value> {
        match job.decode()? {
            JobPayload::RewardCalculation {
                profile_id,
                post_id,
                platform,
                attempt,
            } => {
                self.reward_calculation(&profile_id, &post_id, &platform, attempt, now)
                    .await
            }
            JobPayload::RlUpdate {
                post_id,
                reward_value,
                ..
            } => self.rl_update(&post_id, reward_value),
            JobPayload::ContentGeneration { business_id } => {
                let report = self.cycle.run(&business_id, job.run_at, now).await?;
                let status = if report.skipped { "skipped" } else { "completed" };
                Ok(json!({"status": status, "report": report}))
            }
        }
    }

    async fn reward_calculation(
        &self,
        profile_id: &str,
        post_id: &str,
        platform: &str,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<Value> {
        match self.rewards.compute(profile_id, post_id, platform).await? {
            RewardOutcome::Calculated {
                reward,
                baseline_before,
            } => {
                let follow_up = NewJob::rl_update(profile_id, post_id, platform, reward, now);
                self.jobs.enqueue(&follow_up)?;
                Ok(json!({
                    "status": "calculated",
                    "reward": reward,
                    "baseline": baseline_before,
                    "rl_job": follow_up.job_id,
                }))
            }
            RewardOutcome::AlreadyCalculated { reward, applied } => {
                // The update may have been lost between phases; its id makes
                // re-enqueueing harmless.
                if !applied {
                    self.jobs
                        .enqueue(&NewJob::rl_update(profile_id, post_id, platform, reward, now))?;
                }
                Ok(json!({
                    "status": "already_calculated",
                    "reward": reward,
                    "policy_applied": applied,
                }))
            }
            RewardOutcome::Pending => {
                let next_job = if attempt < self.queue.max_reward_polls {
                    let run_at = now
                        + i64::try_from(self.queue.reward_poll_secs)
                            .ok()
                            .and_then(Duration::try_seconds)
                            .unwrap_or_else(Duration::zero);
                    let job = NewJob::reward_calculation(profile_id, post_id, platform, attempt + 1, run_at);
                    self.jobs.enqueue(&job)?;
                    Some(job.job_id)
                } else {
                    warn!(post_id, attempt, "giving up on engagement metrics");
                    None
                };
                Ok(json!({"status": "pending", "attempt": attempt, "next_job": next_job}))
            }
        }
    }

    fn rl_update(&self, post_id: &str, reward_value: f64) -> Result<Value> {
        match self.rewards.apply(post_id, reward_value) {
            Ok(UpdateOutcome::Applied { advantage }) => {
                self.metrics.record_policy_update();
                Ok(json!({"status": "completed", "advantage": advantage}))
            }
            Ok(UpdateOutcome::AlreadyApplied) => Ok(skipped("already_applied")),
            Ok(UpdateOutcome::MissingActionContext) => Ok(skipped("missing_action_context")),
            Ok(UpdateOutcome::MissingReward) => Ok(skipped("missing_reward")),
            Err(PostloopError::DataIntegrity(msg)) => {
                warn!(post_id, error = %msg, "policy update skipped");
                Ok(json!({"status": "skipped", "reason": "data_integrity", "error": msg}))
            }
            Err(err) => Err(err),
        }
    }
}

fn skipped(reason: &str) -> Value {
    json!({"status": "skipped", "reason": reason})
}
