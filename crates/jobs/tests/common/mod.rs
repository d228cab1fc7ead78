//! Fakes and a throwaway SQLite setup shared by the worker tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use policy::action::{Creativity, HookType, Length, TextInImage, Tone, VisualStyle};
use policy::utils::events::EventLog;
use policy::utils::policy_store::{SqlitePreferenceStore, SqliteWeightStore};
use policy::{Action, ContextBuilder, LearningRates, PolicyEngine};
use postloop_core::{PostloopError, Result, Settings};
use postloop_embeddings::Embedder;
use postloop_jobs::{
    ActionRecord, BusinessProfile, Collaborators, ContentGenerator, ContentRequest,
    GeneratedContent, Ledger, ProfileSource, RewardSource, Services, SqliteJobStore,
    SqliteLedger, TopicSource, Worker,
};
use tempfile::TempDir;

pub const DIM: usize = 4;

/// Monday 18:30 at +05:30.
pub fn monday_evening() -> DateTime<Utc> {
    "2026-10-19T13:00:00Z".parse().unwrap()
}

#[derive(Default)]
pub struct FakeRewards {
    script: Mutex<VecDeque<Result<Option<f64>>>>,
    fallback: Mutex<Option<f64>>,
    pub calls: AtomicUsize,
}

impl FakeRewards {
    pub fn returning(reward: Option<f64>) -> Self {
        let fake = Self::default();
        fake.set(reward);
        fake
    }

    pub fn set(&self, reward: Option<f64>) {
        *self.fallback.lock().unwrap() = reward;
    }

    /// Queues one answer ahead of the fallback.
    pub fn push(&self, result: Result<Option<f64>>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RewardSource for FakeRewards {
    async fn compute_reward(&self, _profile_id: &str, _post_id: &str, _platform: &str) -> Result<Option<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(*self.fallback.lock().unwrap())
    }
}

#[derive(Default)]
pub struct FakeProfiles {
    profiles: Mutex<HashMap<String, BusinessProfile>>,
}

impl FakeProfiles {
    pub fn insert(&self, profile: BusinessProfile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.business_id.clone(), profile);
    }
}

#[async_trait]
impl ProfileSource for FakeProfiles {
    async fn list_profiles(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.profiles.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn profile(&self, business_id: &str) -> Result<Option<BusinessProfile>> {
        Ok(self.profiles.lock().unwrap().get(business_id).cloned())
    }
}

#[derive(Default)]
pub struct FakeTopics {
    pub failing_platforms: Mutex<HashSet<String>>,
}

#[async_trait]
impl TopicSource for FakeTopics {
    async fn suggest_topic(&self, profile: &BusinessProfile, platform: &str, date: NaiveDate) -> Result<String> {
        if self.failing_platforms.lock().unwrap().contains(platform) {
            return Err(PostloopError::TransientExternal("topic provider down".into()));
        }
        Ok(format!("{} on {platform} for {date}", profile.business_id))
    }
}

/// Deterministic embedding derived from the text bytes.
pub struct FakeEmbedder;

impl FakeEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let bytes = text.as_bytes();
        (0..DIM)
            .map(|i| {
                let b = bytes.get(i).copied().unwrap_or(0);
                f32::from(b) / 255.0 - 0.25
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

#[derive(Default)]
pub struct FakeGenerator {
    pub failing_platforms: Mutex<HashSet<String>>,
    pub requests: Mutex<Vec<ContentRequest>>,
}

#[async_trait]
impl ContentGenerator for FakeGenerator {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent> {
        self.requests.lock().unwrap().push(request.clone());
        if self.failing_platforms.lock().unwrap().contains(&request.platform) {
            return Err(PostloopError::Validation("generator returned no caption".into()));
        }
        Ok(GeneratedContent {
            caption: format!("caption about {}", request.topic),
            image_ref: Some(format!("images/{}.png", request.post_id)),
        })
    }
}

pub struct Harness {
    _tmp: TempDir,
    pub db: PathBuf,
    pub settings: Settings,
    pub rewards: Arc<FakeRewards>,
    pub profiles: Arc<FakeProfiles>,
    pub topics: Arc<FakeTopics>,
    pub generator: Arc<FakeGenerator>,
    pub jobs: Arc<SqliteJobStore>,
    pub ledger: Arc<SqliteLedger>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("postloop.db");
        let mut settings = Settings::default();
        settings.embeddings.dim = DIM;
        Self {
            jobs: Arc::new(SqliteJobStore::open(&db).unwrap()),
            ledger: Arc::new(SqliteLedger::open(&db).unwrap()),
            _tmp: tmp,
            db,
            settings,
            rewards: Arc::new(FakeRewards::returning(Some(0.8))),
            profiles: Arc::new(FakeProfiles::default()),
            topics: Arc::new(FakeTopics::default()),
            generator: Arc::new(FakeGenerator::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            rewards: self.rewards.clone(),
            profiles: self.profiles.clone(),
            topics: self.topics.clone(),
            generator: self.generator.clone(),
            embedder: Arc::new(FakeEmbedder),
        }
    }

    pub fn worker(&self) -> Worker {
        let services = Services {
            jobs: self.jobs.clone(),
            ledger: self.ledger.clone(),
            preferences: Arc::new(SqlitePreferenceStore::open(&self.db).unwrap()),
            weights: Arc::new(SqliteWeightStore::open(&self.db).unwrap()),
            collaborators: self.collaborators(),
            events: EventLog::disabled(),
        };
        Worker::new(services, &self.settings).with_seed(7)
    }

    /// An engine over the same stores the worker writes to.
    pub fn engine(&self) -> PolicyEngine {
        PolicyEngine::new(
            Arc::new(SqlitePreferenceStore::open(&self.db).unwrap()),
            Arc::new(SqliteWeightStore::open(&self.db).unwrap()),
            LearningRates::default(),
        )
    }

    pub fn builder(&self) -> ContextBuilder {
        ContextBuilder::new(DIM)
    }

    /// Records the decision behind `post_id` as a content run would.
    pub fn seed_action(&self, post_id: &str, platform: &str) -> ActionRecord {
        let record = ActionRecord {
            post_id: post_id.to_string(),
            profile_id: "biz".into(),
            platform: platform.to_string(),
            time_bucket: "evening".into(),
            day_of_week: "Mon".into(),
            topic: "autumn specials".into(),
            action: sample_action(),
            business_embedding: vec![0.5, -0.25, 0.125, 1.0],
            topic_embedding: FakeEmbedder::vector("autumn specials"),
            created_at: monday_evening(),
        };
        self.ledger.record_action(&record).unwrap();
        record
    }
}

pub fn sample_action() -> Action {
    Action {
        hook_type: HookType::Question,
        length: Length::Short,
        tone: Tone::Casual,
        creativity: Creativity::Safe,
        text_in_image: TextInImage::NoTextInImage,
        visual_style: VisualStyle::HumanFigure,
    }
}

pub fn profile(business_id: &str, platforms: &[&str]) -> BusinessProfile {
    BusinessProfile {
        business_id: business_id.to_string(),
        embedding: Some(vec![0.5, -0.25, 0.125, 1.0]),
        time_bucket: "evening".into(),
        platforms: platforms.iter().map(|p| p.to_string()).collect(),
        brand: Default::default(),
        post_today: true,
    }
}
