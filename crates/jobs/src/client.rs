//! HTTP client for the content backend.
//!
//! One JSON API provides profiles, topic suggestions, content generation and
//! engagement rewards. Every call is bounded by the configured timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use postloop_core::{PostloopError, Result};
use postloop_embeddings::Embedder;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::collaborators::{
    BrandMetadata, BusinessProfile, Collaborators, ContentGenerator, ContentRequest, GeneratedContent, ProfileSource,
    RewardSource, TopicSource,
};

#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: Url,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ProfileList {
    business_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum RewardResponse {
    Calculated { reward: f64 },
    Pending,
}

#[derive(Debug, Deserialize)]
struct TopicResponse {
    topic: String,
}

#[derive(Debug, Serialize)]
struct TopicRequest<'a> {
    business_id: &'a str,
    platform: &'a str,
    date: NaiveDate,
    brand: &'a BrandMetadata,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|err| {
            PostloopError::Configuration(format!("invalid backend url '{base_url}': {err}"))
        })?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PostloopError::Configuration(format!("http client: {err}")))?;
        Ok(Self { base_url, http })
    }

    /// Serves every backend-provided collaborator from this client.
    pub fn into_collaborators(self, embedder: Arc<dyn Embedder>) -> Collaborators {
        let client = Arc::new(self);
        Collaborators {
            rewards: client.clone(),
            profiles: client.clone(),
            topics: client.clone(),
            generator: client,
            embedder,
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|err| PostloopError::Configuration(format!("bad endpoint {path}: {err}")))
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Option<T>> {
        let response = request.send().await.map_err(|err| transport(what, err))?;
        let status = response.status();
        debug!(endpoint = what, %status, "backend responded");
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(PostloopError::Configuration(format!(
                "{what}: backend rejected credentials ({status})"
            )));
        }
        if !status.is_success() {
            return Err(PostloopError::TransientExternal(format!("{what}: status {status}")));
        }
        let body = response.bytes().await.map_err(|err| transport(what, err))?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|err| PostloopError::Validation(format!("{what}: unexpected response: {err}")))
    }
}

fn transport(what: &str, err: reqwest::Error) -> PostloopError {
    PostloopError::TransientExternal(format!("{what}: {err}"))
}

fn required<T>(what: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| PostloopError::TransientExternal(format!("{what}: endpoint not found")))
}

#[async_trait]
impl RewardSource for BackendClient {
    async fn compute_reward(&self, profile_id: &str, post_id: &str, platform: &str) -> Result<Option<f64>> {
        let request = self
            .http
            .post(self.url("v1/rewards")?)
            .json(&json!({"profile_id": profile_id, "post_id": post_id, "platform": platform}));
        match required("rewards", self.send::<RewardResponse>(request, "rewards").await?)? {
            RewardResponse::Calculated { reward } if reward.is_finite() => Ok(Some(reward)),
            RewardResponse::Calculated { reward } => Err(PostloopError::Validation(format!(
                "rewards: non-finite reward {reward} for {post_id}"
            ))),
            RewardResponse::Pending => Ok(None),
        }
    }
}

#[async_trait]
impl ProfileSource for BackendClient {
    async fn list_profiles(&self) -> Result<Vec<String>> {
        let request = self.http.get(self.url("v1/profiles")?);
        let list: ProfileList = required("profiles", self.send(request, "profiles").await?)?;
        Ok(list.business_ids)
    }

    async fn profile(&self, business_id: &str) -> Result<Option<BusinessProfile>> {
        let mut url = self.url("v1/profiles/")?;
        url.path_segments_mut()
            .map_err(|_| PostloopError::Configuration("backend url cannot be a base".into()))?
            .pop_if_empty()
            .push(business_id);
        self.send(self.http.get(url), "profile").await
    }
}

#[async_trait]
impl TopicSource for BackendClient {
    async fn suggest_topic(&self, profile: &BusinessProfile, platform: &str, date: NaiveDate) -> Result<String> {
        let request = self.http.post(self.url("v1/topics")?).json(&TopicRequest {
            business_id: &profile.business_id,
            platform,
            date,
            brand: &profile.brand,
        });
        let response: TopicResponse = required("topics", self.send(request, "topics").await?)?;
        let topic = response.topic.trim();
        if topic.is_empty() {
            return Err(PostloopError::Validation("topics: empty topic".into()));
        }
        Ok(topic.to_string())
    }
}

#[async_trait]
impl ContentGenerator for BackendClient {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent> {
        let http_request = self.http.post(self.url("v1/content")?).json(request);
        let content: GeneratedContent = required("content", self.send(http_request, "content").await?)?;
        if content.caption.trim().is_empty() {
            return Err(PostloopError::Validation(format!(
                "content: empty caption for {}",
                request.post_id
            )));
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_responses_decode_by_status() {
        let calculated: RewardResponse =
            serde_json::from_str(r#"{"status": "calculated", "reward": 0.42}"#).unwrap();
        assert!(matches!(calculated, RewardResponse::Calculated { reward } if reward == 0.42));
        let pending: RewardResponse = serde_json::from_str(r#"{"status": "pending"}"#).unwrap();
        assert!(matches!(pending, RewardResponse::Pending));
    }

    #[test]
    fn endpoints_join_onto_the_base() {
        let client = BackendClient::new("http://127.0.0.1:8790/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("v1/rewards").unwrap().as_str(), "http://127.0.0.1:8790/api/v1/rewards");
    }

    #[test]
    fn invalid_base_url_is_a_configuration_error() {
        let err = BackendClient::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, PostloopError::Configuration(_)));
    }
}
