mod common;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use common::{monday_evening, profile, FakeEmbedder, Harness};
use postloop_jobs::cycle::{bootstrap, content_job, schedule_now};
use postloop_jobs::{CycleReport, JobStatus, JobStore, Ledger};

async fn run_content_job(h: &Harness, business_id: &str) -> (CycleReport, JobStatus) {
    let now = monday_evening();
    let (job_id, inserted) = schedule_now(h.jobs.as_ref(), business_id, &h.settings.scheduling, now).unwrap();
    assert!(inserted);
    assert_eq!(job_id, format!("content_gen_{business_id}_2026-10-19"));

    let worker = h.worker();
    worker.run_once_at(now).await.unwrap();
    let job = h.jobs.get(&job_id).unwrap().unwrap();
    let report = job
        .result
        .as_ref()
        .map(|r| serde_json::from_value(r["report"].clone()).unwrap())
        .unwrap_or_default();
    (report, job.status)
}

#[tokio::test]
async fn one_failing_platform_does_not_block_the_others() {
    let h = Harness::new();
    h.profiles
        .insert(profile("cafe", &["Instagram", "facebook", " instagram ", "tiktok"]));
    h.generator
        .failing_platforms
        .lock()
        .unwrap()
        .insert("facebook".into());

    let (report, status) = run_content_job(&h, "cafe").await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(report.posts.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].platform, "facebook");

    let post = &report.posts[0];
    assert_eq!(post.platform, "instagram");
    assert!(post.post_id.starts_with("instagram_"));
    assert_eq!(post.reward_job, format!("reward_{}", post.post_id));

    let reward_job = h.jobs.get(&post.reward_job).unwrap().unwrap();
    assert_eq!(reward_job.status, JobStatus::Queued);
    assert_eq!(reward_job.payload["profile_id"], "cafe");

    let stored = h.ledger.post(&post.post_id).unwrap().unwrap();
    assert_eq!(stored.caption, format!("caption about {}", post.topic));

    let action = h.ledger.action(&post.post_id).unwrap().unwrap();
    assert_eq!(action.day_of_week, "Mon");
    assert_eq!(action.time_bucket, "evening");
    assert_eq!(action.topic_embedding, FakeEmbedder::vector(&post.topic));

    // Tiktok is not a configured platform and never reaches the generator.
    let requested: Vec<String> = h
        .generator
        .requests
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.platform.clone())
        .collect();
    assert_eq!(requested.len(), 2);
    assert!(!requested.contains(&"tiktok".to_string()));
}

#[tokio::test]
async fn next_day_is_scheduled_at_the_local_content_time() {
    let h = Harness::new();
    h.profiles.insert(profile("cafe", &["instagram"]));

    let (report, _) = run_content_job(&h, "cafe").await;
    assert_eq!(report.next_job.as_deref(), Some("content_gen_cafe_2026-10-20"));
    let next = h.jobs.get("content_gen_cafe_2026-10-20").unwrap().unwrap();
    assert_eq!(next.status, JobStatus::Queued);
    assert_eq!(
        next.run_at,
        "2026-10-20T04:40:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap()
    );
}

#[tokio::test]
async fn late_run_after_local_midnight_schedules_the_next_day() {
    let h = Harness::new();
    h.profiles.insert(profile("cafe", &["instagram"]));
    let due = content_job("cafe", NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(), &h.settings.scheduling).unwrap();
    assert!(h.jobs.enqueue(&due).unwrap());

    // 00:30 local on the 20th, long after the job was due.
    let late: DateTime<Utc> = "2026-10-19T19:00:00Z".parse().unwrap();
    let worker = h.worker();
    worker.run_once_at(late).await.unwrap();

    let job = h.jobs.get("content_gen_cafe_2026-10-19").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let report: CycleReport = serde_json::from_value(job.result.unwrap()["report"].clone()).unwrap();
    assert_eq!(report.next_job.as_deref(), Some("content_gen_cafe_2026-10-20"));
    assert!(h.jobs.get("content_gen_cafe_2026-10-21").unwrap().is_none());
}

#[tokio::test]
async fn topic_failures_fall_back_to_the_configured_topic() {
    let h = Harness::new();
    h.profiles.insert(profile("cafe", &["instagram"]));
    h.topics
        .failing_platforms
        .lock()
        .unwrap()
        .insert("instagram".into());

    let (report, _) = run_content_job(&h, "cafe").await;
    assert_eq!(report.posts.len(), 1);
    assert_eq!(report.posts[0].topic, h.settings.scheduling.fallback_topic);
}

#[tokio::test]
async fn missing_business_embedding_fails_each_platform_only() {
    let h = Harness::new();
    let mut cafe = profile("cafe", &["instagram", "facebook"]);
    cafe.embedding = None;
    h.profiles.insert(cafe);

    let (report, status) = run_content_job(&h, "cafe").await;
    assert_eq!(status, JobStatus::Completed);
    assert!(report.posts.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert!(report.failed[0].error.starts_with("Configuration error"));
    assert!(report.next_job.is_some());
}

#[tokio::test]
async fn profiles_can_opt_out_for_the_day() {
    let h = Harness::new();
    let mut cafe = profile("cafe", &["instagram"]);
    cafe.post_today = false;
    h.profiles.insert(cafe);

    let (report, status) = run_content_job(&h, "cafe").await;
    assert_eq!(status, JobStatus::Completed);
    assert!(report.skipped);
    assert!(report.posts.is_empty());
    assert!(h.generator.requests.lock().unwrap().is_empty());
    assert!(h.jobs.get("content_gen_cafe_2026-10-20").unwrap().is_some());
}

#[tokio::test]
async fn unknown_business_fails_permanently() {
    let h = Harness::new();
    let (_, status) = run_content_job(&h, "ghost").await;
    assert_eq!(status, JobStatus::Failed);
    let job = h.jobs.get("content_gen_ghost_2026-10-19").unwrap().unwrap();
    assert_eq!(job.retry_count, 0);
}

#[tokio::test]
async fn bootstrap_queues_every_profile_once() {
    let h = Harness::new();
    h.profiles.insert(profile("bakery", &["instagram"]));
    h.profiles.insert(profile("cafe", &["facebook"]));
    let now = monday_evening();

    let queued = bootstrap(&h.collaborators(), h.jobs.as_ref(), &h.settings.scheduling, now)
        .await
        .unwrap();
    assert_eq!(
        queued,
        vec!["content_gen_bakery_2026-10-19", "content_gen_cafe_2026-10-19"]
    );
    let again = bootstrap(&h.collaborators(), h.jobs.as_ref(), &h.settings.scheduling, now + Duration::minutes(5))
        .await
        .unwrap();
    assert!(again.is_empty());
}
