mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{monday_evening, FakeRewards, Harness};
use policy::{Dimension, PreferenceKey, PreferenceStore};
use policy::utils::policy_store::SqlitePreferenceStore;
use postloop_jobs::{JobStatus, JobStore, Ledger, NewJob, RewardPipeline, UpdateOutcome};
use serde_json::json;

fn enqueue_reward(h: &Harness, post_id: &str, platform: &str) {
    h.jobs
        .enqueue(&NewJob::reward_calculation("biz", post_id, platform, 0, monday_evening()))
        .unwrap();
}

#[tokio::test]
async fn reward_job_chains_exactly_one_policy_update() {
    let h = Harness::new();
    let record = h.seed_action("instagram_a", "instagram");
    enqueue_reward(&h, "instagram_a", "instagram");
    let worker = h.worker();
    let now = monday_evening();

    let first = worker.run_once_at(now).await.unwrap();
    assert_eq!(first.completed, 1);

    let reward_job = h.jobs.get("reward_instagram_a").unwrap().unwrap();
    assert_eq!(reward_job.status, JobStatus::Completed);
    assert_eq!(reward_job.result.as_ref().unwrap()["status"], "calculated");
    let rl_jobs: Vec<_> = h
        .jobs
        .list(None, 50)
        .unwrap()
        .into_iter()
        .filter(|j| j.job_type == "rl_update")
        .collect();
    assert_eq!(rl_jobs.len(), 1);
    assert_eq!(rl_jobs[0].job_id, "rl_instagram_a");
    assert_eq!(rl_jobs[0].payload["reward_value"], 0.8);

    let stored = h.ledger.reward("instagram_a").unwrap().unwrap();
    assert_eq!(stored.baseline_at_computation, 0.0);
    assert!((h.ledger.baseline("instagram").unwrap().unwrap() - 0.08).abs() < 1e-12);

    let second = worker.run_once_at(now).await.unwrap();
    assert_eq!(second.completed, 1);
    let rl_job = h.jobs.get("rl_instagram_a").unwrap().unwrap();
    assert_eq!(rl_job.result, Some(json!({"status": "completed", "advantage": 0.8})));
    assert_eq!(worker.metrics().policy_updates(), 1);

    let prefs = SqlitePreferenceStore::open(&h.db).unwrap();
    let ctx = record.context(&h.builder()).unwrap();
    let cell = PreferenceKey::new(&ctx.slot, Dimension::Tone, "casual");
    let value = prefs.preference(&cell).unwrap().unwrap();
    assert!((value - 0.05 * 0.8).abs() < 1e-12);

    assert_eq!(worker.run_once_at(now).await.unwrap().fetched, 0);
}

#[tokio::test]
async fn policy_update_is_applied_once() {
    let h = Harness::new();
    let record = h.seed_action("facebook_a", "facebook");
    h.ledger.record_reward("facebook_a", "facebook", 1.0, 0.1).unwrap();

    let pipeline = RewardPipeline::new(
        h.ledger.clone(),
        h.rewards.clone(),
        h.engine(),
        h.builder(),
        0.1,
    );
    assert_eq!(
        pipeline.apply("facebook_a", 1.0).unwrap(),
        UpdateOutcome::Applied { advantage: 1.0 }
    );
    assert_eq!(pipeline.apply("facebook_a", 1.0).unwrap(), UpdateOutcome::AlreadyApplied);

    let prefs = SqlitePreferenceStore::open(&h.db).unwrap();
    let ctx = record.context(&h.builder()).unwrap();
    let value = prefs
        .preference(&PreferenceKey::new(&ctx.slot, Dimension::Length, "short"))
        .unwrap()
        .unwrap();
    assert!((value - 0.05).abs() < 1e-12);
}

#[tokio::test]
async fn recalculation_requeues_an_unapplied_update() {
    let h = Harness::new();
    h.seed_action("instagram_b", "instagram");
    h.ledger.record_reward("instagram_b", "instagram", 0.3, 0.1).unwrap();
    enqueue_reward(&h, "instagram_b", "instagram");

    let worker = h.worker();
    worker.run_once_at(monday_evening()).await.unwrap();

    let job = h.jobs.get("reward_instagram_b").unwrap().unwrap();
    assert_eq!(job.result.unwrap()["status"], "already_calculated");
    assert_eq!(h.rewards.calls(), 0);
    let rl = h.jobs.get("rl_instagram_b").unwrap().unwrap();
    assert_eq!(rl.status, JobStatus::Queued);
    assert_eq!(rl.payload["reward_value"], 0.3);
}

#[tokio::test]
async fn missing_action_skips_the_update_but_completes() {
    let h = Harness::new();
    enqueue_reward(&h, "instagram_ghost", "instagram");
    let worker = h.worker();
    let now = monday_evening();

    worker.run_once_at(now).await.unwrap();
    let report = worker.run_once_at(now).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let rl = h.jobs.get("rl_instagram_ghost").unwrap().unwrap();
    assert_eq!(rl.status, JobStatus::Completed);
    assert_eq!(rl.retry_count, 0);
    assert_eq!(
        rl.result,
        Some(json!({"status": "skipped", "reason": "missing_action_context"}))
    );
    assert_eq!(worker.metrics().policy_updates(), 0);
    assert!(h.ledger.reward("instagram_ghost").unwrap().unwrap().policy_applied_at.is_none());
}

#[tokio::test]
async fn pending_metrics_are_polled_a_bounded_number_of_times() {
    let mut h = Harness::new();
    h.rewards = Arc::new(FakeRewards::returning(None));
    h.settings.queue.max_reward_polls = 2;
    h.settings.queue.reward_poll_secs = 3600;
    h.seed_action("instagram_c", "instagram");
    enqueue_reward(&h, "instagram_c", "instagram");
    let worker = h.worker();
    let start = monday_evening();

    worker.run_once_at(start).await.unwrap();
    let first = h.jobs.get("reward_instagram_c_1").unwrap().unwrap();
    assert_eq!(first.run_at, start + Duration::hours(1));
    assert_eq!(worker.run_once_at(start).await.unwrap().fetched, 0);

    worker.run_once_at(start + Duration::hours(1)).await.unwrap();
    assert!(h.jobs.get("reward_instagram_c_2").unwrap().is_some());

    worker.run_once_at(start + Duration::hours(2)).await.unwrap();
    assert!(h.jobs.get("reward_instagram_c_3").unwrap().is_none());
    let last = h.jobs.get("reward_instagram_c_2").unwrap().unwrap();
    assert_eq!(last.result.unwrap()["next_job"], serde_json::Value::Null);
    assert_eq!(h.rewards.calls(), 3);
    assert!(h.ledger.reward("instagram_c").unwrap().is_none());
}

#[tokio::test]
async fn cold_start_reward_favours_the_rewarded_value() {
    let mut h = Harness::new();
    h.rewards = Arc::new(FakeRewards::returning(Some(1.0)));
    let record = h.seed_action("instagram_d", "instagram");
    let engine = h.engine();
    let ctx = record.context(&h.builder()).unwrap();
    assert_eq!(ctx.slot.day_of_week, "Mon");

    let before = engine.distribution(&ctx, Dimension::Length).unwrap();
    assert!((before[0].1 - 0.5).abs() < 1e-12);
    assert!((before[1].1 - 0.5).abs() < 1e-12);

    enqueue_reward(&h, "instagram_d", "instagram");
    let worker = h.worker();
    worker.run_once_at(monday_evening()).await.unwrap();
    worker.run_once_at(monday_evening()).await.unwrap();

    let after = engine.distribution(&ctx, Dimension::Length).unwrap();
    let short_before = before.iter().find(|(v, _)| *v == "short").unwrap().1;
    let short_after = after.iter().find(|(v, _)| *v == "short").unwrap().1;
    assert!(short_after > short_before, "{short_after} <= {short_before}");
}
