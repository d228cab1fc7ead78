//! Settles engagement rewards into the policy.
//!
//! Settlement runs in two phases so each can be retried on its own:
//! [`RewardPipeline::compute`] fixes the reward and the baseline it is
//! measured against, [`RewardPipeline::apply`] credits the advantage to the
//! action that produced the post.

use std::sync::Arc;

use policy::utils::events::EventLog;
use policy::{ContextBuilder, PolicyEngine};
use postloop_core::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::collaborators::RewardSource;
use crate::ledger::{Ledger, RewardEntry};

#[derive(Debug, Clone, PartialEq)]
pub enum RewardOutcome {
    /// First computation; the baseline moved.
    Calculated {
        reward: f64,
        baseline_before: f64,
    },
    /// A reward was stored earlier. `applied` tells whether the policy update
    /// for it has already run.
    AlreadyCalculated { reward: f64, applied: bool },
    /// Metrics are not available yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied { advantage: f64 },
    AlreadyApplied,
    MissingActionContext,
    MissingReward,
}

pub struct RewardPipeline {
    ledger: Arc<dyn Ledger>,
    rewards: Arc<dyn RewardSource>,
    engine: PolicyEngine,
    builder: ContextBuilder,
    beta: f64,
    events: EventLog,
}

impl RewardPipeline {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        rewards: Arc<dyn RewardSource>,
        engine: PolicyEngine,
        builder: ContextBuilder,
        beta: f64,
    ) -> Self {
        Self {
            ledger,
            rewards,
            engine,
            builder,
            beta,
            events: EventLog::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub async fn compute(&self, profile_id: &str, post_id: &str, platform: &str) -> Result<RewardOutcome> {
        if let Some(existing) = self.ledger.reward(post_id)? {
            return Ok(RewardOutcome::AlreadyCalculated {
                reward: existing.reward,
                applied: existing.policy_applied_at.is_some(),
            });
        }

        let Some(reward) = self.rewards.compute_reward(profile_id, post_id, platform).await? else {
            info!(post_id, platform, "engagement metrics not available yet");
            return Ok(RewardOutcome::Pending);
        };

        match self.ledger.record_reward(post_id, platform, reward, self.beta)? {
            RewardEntry::Created(record) => {
                info!(
                    post_id,
                    platform,
                    reward,
                    baseline = record.baseline_at_computation,
                    "reward calculated"
                );
                Ok(RewardOutcome::Calculated {
                    reward,
                    baseline_before: record.baseline_at_computation,
                })
            }
            // Another worker stored it between our read and write.
            RewardEntry::Existing(record) => Ok(RewardOutcome::AlreadyCalculated {
                reward: record.reward,
                applied: record.policy_applied_at.is_some(),
            }),
        }
    }

    pub fn apply(&self, post_id: &str, reward_value: f64) -> Result<UpdateOutcome> {
        let Some(record) = self.ledger.reward(post_id)? else {
            warn!(post_id, "no reward record, skipping policy update");
            return Ok(UpdateOutcome::MissingReward);
        };
        if record.policy_applied_at.is_some() {
            return Ok(UpdateOutcome::AlreadyApplied);
        }
        if (record.reward - reward_value).abs() > f64::EPSILON {
            warn!(
                post_id,
                stored = record.reward,
                requested = reward_value,
                "job reward differs from stored reward, using stored"
            );
        }

        let Some(action_record) = self.ledger.action(post_id)? else {
            warn!(post_id, "original action not found, skipping policy update");
            return Ok(UpdateOutcome::MissingActionContext);
        };

        let ctx = action_record.context(&self.builder)?;
        let advantage = record.advantage();
        self.engine.apply_update(&ctx, &action_record.action, advantage)?;
        self.ledger.mark_applied(post_id)?;

        info!(
            post_id,
            platform = %ctx.slot.platform,
            reward = record.reward,
            advantage,
            "policy updated"
        );
        self.events.write(
            "policy.update",
            &json!({
                "post_id": post_id,
                "platform": ctx.slot.platform,
                "time_bucket": ctx.slot.time_bucket,
                "day_of_week": ctx.slot.day_of_week,
                "reward": record.reward,
                "baseline": record.baseline_at_computation,
                "advantage": advantage,
                "action": action_record.action,
            }),
        );
        Ok(UpdateOutcome::Applied { advantage })
    }
}
