//! Daily content cycle for one business.
//!
//! Each connected platform is handled on its own: a failure on one platform is
//! recorded in the report and the others still get their post.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use policy::context::{day_of_week, local_time, utc_offset};
use policy::utils::events::EventLog;
use policy::{ContextBuilder, PolicyEngine};
use postloop_core::config::Scheduling;
use postloop_core::{PostloopError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use ulid::Ulid;

use crate::collaborators::{BusinessProfile, Collaborators, ContentRequest};
use crate::job::NewJob;
use crate::ledger::{ActionRecord, Ledger, PostRecord};
use crate::queue::JobStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedPost {
    pub post_id: String,
    pub platform: String,
    pub topic: String,
    pub reward_job: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformFailure {
    pub platform: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub business_id: String,
    /// The profile asked not to post today.
    pub skipped: bool,
    pub posts: Vec<CreatedPost>,
    pub failed: Vec<PlatformFailure>,
    pub next_job: Option<String>,
}

pub struct ContentCycle {
    collaborators: Collaborators,
    ledger: Arc<dyn Ledger>,
    jobs: Arc<dyn JobStore>,
    engine: PolicyEngine,
    builder: ContextBuilder,
    scheduling: Scheduling,
    reward_delay: Duration,
    rng: Mutex<StdRng>,
    events: EventLog,
}

impl ContentCycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collaborators: Collaborators,
        ledger: Arc<dyn Ledger>,
        jobs: Arc<dyn JobStore>,
        engine: PolicyEngine,
        builder: ContextBuilder,
        scheduling: Scheduling,
        reward_delay_secs: u64,
        events: EventLog,
    ) -> Self {
        Self {
            collaborators,
            ledger,
            jobs,
            engine,
            builder,
            scheduling,
            reward_delay: i64::try_from(reward_delay_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or_else(Duration::zero),
            rng: Mutex::new(StdRng::from_os_rng()),
            events,
        }
    }

    /// Makes action sampling reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Runs the content job that was due at `scheduled_for`. The follow-up is
    /// scheduled for the local day after `scheduled_for`, so a late run does
    /// not skip a day.
    pub async fn run(&self, business_id: &str, scheduled_for: DateTime<Utc>, now: DateTime<Utc>) -> Result<CycleReport> {
        let profile = self
            .collaborators
            .profiles
            .profile(business_id)
            .await?
            .ok_or_else(|| PostloopError::DataIntegrity(format!("unknown business {business_id}")))?;

        let mut report = CycleReport {
            business_id: business_id.to_string(),
            ..CycleReport::default()
        };

        if profile.post_today {
            for platform in self.platforms(&profile) {
                match self.run_platform(&profile, &platform, now).await {
                    Ok(post) => {
                        info!(business_id, platform = %platform, post_id = %post.post_id, "post created");
                        report.posts.push(post);
                    }
                    Err(err) => {
                        warn!(business_id, platform = %platform, error = %err, "platform failed");
                        report.failed.push(PlatformFailure {
                            platform: platform.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        } else {
            info!(business_id, "not scheduled to post today");
            report.skipped = true;
        }

        report.next_job = Some(self.schedule_next_day(business_id, scheduled_for)?);
        Ok(report)
    }

    /// Connected platforms, normalised and restricted to the configured set.
    fn platforms(&self, profile: &BusinessProfile) -> Vec<String> {
        let mut seen = BTreeSet::new();
        profile
            .platforms
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| {
                let allowed = self.scheduling.platforms.iter().any(|a| a == p);
                if !allowed {
                    info!(business_id = %profile.business_id, platform = %p, "skipping unsupported platform");
                }
                allowed
            })
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }

    async fn run_platform(&self, profile: &BusinessProfile, platform: &str, now: DateTime<Utc>) -> Result<CreatedPost> {
        let business_embedding = profile.embedding.as_deref().ok_or_else(|| {
            PostloopError::Configuration(format!(
                "business {} has no embedding yet",
                profile.business_id
            ))
        })?;

        let local_date = local_time(now, self.scheduling.utc_offset_minutes).date_naive();
        let topic = match self
            .collaborators
            .topics
            .suggest_topic(profile, platform, local_date)
            .await
        {
            Ok(topic) => topic,
            Err(err) => {
                warn!(platform, error = %err, "topic suggestion failed, using fallback topic");
                self.scheduling.fallback_topic.clone()
            }
        };

        let topic_embedding = self
            .collaborators
            .embedder
            .embed_one(&topic)
            .await
            .map_err(|err| PostloopError::TransientExternal(format!("topic embedding: {err:#}")))?;

        let day = day_of_week(now, self.scheduling.utc_offset_minutes);
        let ctx = self.builder.build(
            platform,
            &profile.time_bucket,
            &day,
            Some(business_embedding),
            Some(topic_embedding.as_slice()),
        )?;

        let decision = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.engine.select(&ctx, &mut *rng)?
        };

        let post_id = format!("{platform}_{}", Ulid::new().to_string().to_lowercase());
        self.ledger.record_action(&ActionRecord {
            post_id: post_id.clone(),
            profile_id: profile.business_id.clone(),
            platform: platform.to_string(),
            time_bucket: profile.time_bucket.clone(),
            day_of_week: day.clone(),
            topic: topic.clone(),
            action: decision.action,
            business_embedding: business_embedding.to_vec(),
            topic_embedding,
            created_at: now,
        })?;
        self.events.write(
            "policy.select",
            &json!({
                "post_id": post_id,
                "platform": platform,
                "time_bucket": profile.time_bucket,
                "day_of_week": day,
                "action": decision.action,
                "probabilities": decision.probabilities,
            }),
        );

        let request = ContentRequest::from_action(profile, &post_id, platform, &topic, &decision.action);
        let content = self.collaborators.generator.generate(&request).await?;

        self.ledger.record_post(&PostRecord {
            post_id: post_id.clone(),
            business_id: profile.business_id.clone(),
            platform: platform.to_string(),
            topic: topic.clone(),
            caption: content.caption,
            image_ref: content.image_ref,
            created_at: now,
        })?;

        let reward_job = NewJob::reward_calculation(
            &profile.business_id,
            &post_id,
            platform,
            0,
            now + self.reward_delay,
        );
        self.jobs.enqueue(&reward_job)?;

        Ok(CreatedPost {
            post_id,
            platform: platform.to_string(),
            topic,
            reward_job: reward_job.job_id,
        })
    }

    fn schedule_next_day(&self, business_id: &str, scheduled_for: DateTime<Utc>) -> Result<String> {
        let tomorrow =
            local_time(scheduled_for, self.scheduling.utc_offset_minutes).date_naive() + Duration::days(1);
        let job = content_job(business_id, tomorrow, &self.scheduling)?;
        if self.jobs.enqueue(&job)? {
            info!(business_id, job_id = %job.job_id, run_at = %job.run_at, "next content generation scheduled");
        }
        Ok(job.job_id)
    }
}

/// A `content_generation` job for `local_date` at the configured local time.
pub fn content_job(business_id: &str, local_date: NaiveDate, scheduling: &Scheduling) -> Result<NewJob> {
    let time = NaiveTime::from_hms_opt(scheduling.content_hour, scheduling.content_minute, 0)
        .ok_or_else(|| {
            PostloopError::Configuration(format!(
                "invalid content time {:02}:{:02}",
                scheduling.content_hour, scheduling.content_minute
            ))
        })?;
    let run_at = utc_offset(scheduling.utc_offset_minutes)
        .from_local_datetime(&local_date.and_time(time))
        .single()
        .ok_or_else(|| PostloopError::Configuration(format!("no local time {local_date} {time}")))?
        .with_timezone(&Utc);
    Ok(NewJob::content_generation(business_id, local_date, run_at))
}

/// Queues a content run for `business_id` that is due at `now`.
pub fn schedule_now(jobs: &dyn JobStore, business_id: &str, scheduling: &Scheduling, now: DateTime<Utc>) -> Result<(String, bool)> {
    let local_date = local_time(now, scheduling.utc_offset_minutes).date_naive();
    let job = NewJob::content_generation(business_id, local_date, now);
    let inserted = jobs.enqueue(&job)?;
    Ok((job.job_id, inserted))
}

/// Queues today's content run for every known profile.
pub async fn bootstrap(
    collaborators: &Collaborators,
    jobs: &dyn JobStore,
    scheduling: &Scheduling,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let mut queued = Vec::new();
    for business_id in collaborators.profiles.list_profiles().await? {
        let (job_id, inserted) = schedule_now(jobs, &business_id, scheduling, now)?;
        if inserted {
            queued.push(job_id);
        }
    }
    info!(count = queued.len(), "bootstrap queued content generation");
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_job_runs_at_local_time() {
        let scheduling = Scheduling::default();
        let day = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let job = content_job("biz", day, &scheduling).unwrap();
        assert_eq!(job.job_id, "content_gen_biz_2026-10-17");
        // 10:10 at +05:30 is 04:40 UTC.
        assert_eq!(
            job.run_at,
            "2026-10-17T04:40:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn invalid_content_time_is_rejected() {
        let scheduling = Scheduling {
            content_hour: 25,
            ..Scheduling::default()
        };
        let day = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        assert!(matches!(
            content_job("biz", day, &scheduling),
            Err(PostloopError::Configuration(_))
        ));
    }
}
