//! Services the pipeline calls out to. Only the contracts live here; the
//! HTTP implementation is in [`crate::client`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use policy::Action;
use postloop_core::Result;
use postloop_embeddings::Embedder;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrandMetadata {
    #[serde(default)]
    pub brand_voice: String,
    #[serde(default)]
    pub business_types: Vec<String>,
    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub logo_url: Option<String>,
}

fn post_today_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub business_id: String,
    /// Absent until the profile has been embedded.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub time_bucket: String,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub brand: BrandMetadata,
    #[serde(default = "post_today_default")]
    pub post_today: bool,
}

/// What the content generator is asked to produce for one post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRequest {
    pub business_id: String,
    pub post_id: String,
    pub platform: String,
    pub topic: String,
    pub caption_instruction: String,
    pub image_instruction: String,
    pub brand: BrandMetadata,
}

impl ContentRequest {
    /// Turns the selected action into plain-language instructions.
    pub fn from_action(
        profile: &BusinessProfile,
        post_id: &str,
        platform: &str,
        topic: &str,
        action: &Action,
    ) -> Self {
        let caption_instruction = format!(
            "Write a {tone} {length} caption that opens with a {hook}, at a {creativity} creativity level. \
             The topic is {topic}. Make it suitable for {platform}.",
            tone = action.tone,
            length = action.length,
            hook = action.hook_type,
            creativity = action.creativity,
        );
        let image_instruction = format!(
            "Create an image in {style} style with a {tone} tone and {creativity} creativity, {text}. \
             The topic is {topic}. Make it engaging for {platform}. Do not put the caption into the image.",
            style = action.visual_style,
            tone = action.tone,
            creativity = action.creativity,
            text = action.text_in_image,
        );
        Self {
            business_id: profile.business_id.clone(),
            post_id: post_id.to_string(),
            platform: platform.to_string(),
            topic: topic.to_string(),
            caption_instruction,
            image_instruction,
            brand: profile.brand.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub caption: String,
    #[serde(default)]
    pub image_ref: Option<String>,
}

#[async_trait]
pub trait RewardSource: Send + Sync {
    /// `Ok(None)` while engagement metrics are not available yet.
    async fn compute_reward(&self, profile_id: &str, post_id: &str, platform: &str) -> Result<Option<f64>>;
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn list_profiles(&self) -> Result<Vec<String>>;
    async fn profile(&self, business_id: &str) -> Result<Option<BusinessProfile>>;
}

#[async_trait]
pub trait TopicSource: Send + Sync {
    async fn suggest_topic(&self, profile: &BusinessProfile, platform: &str, date: NaiveDate) -> Result<String>;
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent>;
}

/// The full set of outside services a worker needs.
#[derive(Clone)]
pub struct Collaborators {
    pub rewards: Arc<dyn RewardSource>,
    pub profiles: Arc<dyn ProfileSource>,
    pub topics: Arc<dyn TopicSource>,
    pub generator: Arc<dyn ContentGenerator>,
    pub embedder: Arc<dyn Embedder>,
}
