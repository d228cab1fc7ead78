use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

use crate::error::PostloopError;

const fn default_lr_discrete() -> f64 {
    0.05
}

const fn default_lr_continuous() -> f64 {
    0.01
}

const fn default_baseline_beta() -> f64 {
    0.1
}

const fn default_embedding_dim() -> usize {
    1536
}

fn default_embedding_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_batch_size() -> usize {
    20
}

const fn default_reward_delay_secs() -> u64 {
    0
}

const fn default_reward_poll_secs() -> u64 {
    6 * 60 * 60
}

const fn default_max_reward_polls() -> u32 {
    4
}

const fn default_claim_lease_secs() -> u64 {
    30 * 60
}

fn default_platforms() -> Vec<String> {
    vec!["instagram".to_string(), "facebook".to_string()]
}

const fn default_utc_offset_minutes() -> i32 {
    330
}

const fn default_content_hour() -> u32 {
    10
}

const fn default_content_minute() -> u32 {
    10
}

fn default_fallback_topic() -> String {
    "Get to know our brand and what we do, Give a brief introduction to the business and what we do"
        .to_string()
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8790".to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub learning: Learning,
    #[serde(default)]
    pub embeddings: Embeddings,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub scheduling: Scheduling,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub storage: Storage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Learning {
    #[serde(default = "default_lr_discrete")]
    pub lr_discrete: f64,
    #[serde(default = "default_lr_continuous")]
    pub lr_continuous: f64,
    /// Smoothing factor of the per-platform reward baseline.
    #[serde(default = "default_baseline_beta")]
    pub baseline_beta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Embeddings {
    /// Length of a single embedding; the context vector is twice as long.
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Queue {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_reward_delay_secs")]
    pub reward_delay_secs: u64,
    #[serde(default = "default_reward_poll_secs")]
    pub reward_poll_secs: u64,
    #[serde(default = "default_max_reward_polls")]
    pub max_reward_polls: u32,
    /// A `running` job older than this is assumed orphaned and requeued.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scheduling {
    #[serde(default = "default_platforms")]
    pub platforms: Vec<String>,
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_content_hour")]
    pub content_hour: u32,
    #[serde(default = "default_content_minute")]
    pub content_minute: u32,
    #[serde(default = "default_fallback_topic")]
    pub fallback_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Backend {
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Storage {
    /// Optional path of the SQLite file. Default: $POSTLOOP_DATA/state/postloop.db
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

#[allow(clippy::derivable_impls)]
impl Default for Settings {
    fn default() -> Self {
        Self {
            learning: Learning::default(),
            embeddings: Embeddings::default(),
            queue: Queue::default(),
            scheduling: Scheduling::default(),
            backend: Backend::default(),
            storage: Storage::default(),
        }
    }
}

impl Default for Learning {
    fn default() -> Self {
        Self {
            lr_discrete: default_lr_discrete(),
            lr_continuous: default_lr_continuous(),
            baseline_beta: default_baseline_beta(),
        }
    }
}

impl Default for Embeddings {
    fn default() -> Self {
        Self {
            dim: default_embedding_dim(),
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
        }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
            reward_delay_secs: default_reward_delay_secs(),
            reward_poll_secs: default_reward_poll_secs(),
            max_reward_polls: default_max_reward_polls(),
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

impl Default for Scheduling {
    fn default() -> Self {
        Self {
            platforms: default_platforms(),
            utc_offset_minutes: default_utc_offset_minutes(),
            content_hour: default_content_hour(),
            content_minute: default_content_minute(),
            fallback_topic: default_fallback_topic(),
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Settings {
    /// Rejects values the learning loop or the queue cannot work with.
    pub fn validate(&self) -> crate::Result<()> {
        let beta = self.learning.baseline_beta;
        if !(beta > 0.0 && beta < 1.0) {
            return Err(PostloopError::Configuration(format!(
                "learning.baseline_beta must lie in (0, 1), got {beta}"
            )));
        }
        if self.queue.max_retries == 0 {
            return Err(PostloopError::Configuration(
                "queue.max_retries must be at least 1".into(),
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(PostloopError::Configuration(
                "queue.batch_size must be at least 1".into(),
            ));
        }
        if self.queue.claim_lease_secs == 0 {
            return Err(PostloopError::Configuration(
                "queue.claim_lease_secs must be positive".into(),
            ));
        }
        if self.embeddings.dim == 0 {
            return Err(PostloopError::Configuration(
                "embeddings.dim must be positive".into(),
            ));
        }
        if self.scheduling.content_hour > 23 || self.scheduling.content_minute > 59 {
            return Err(PostloopError::Configuration(format!(
                "invalid content time {:02}:{:02}",
                self.scheduling.content_hour, self.scheduling.content_minute
            )));
        }
        Ok(())
    }
}

pub fn load_settings<P: AsRef<Path>>(path: P) -> anyhow::Result<Settings> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml_ng::from_str(&content) {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to parse settings YAML, falling back to defaults"
                );
                Ok(Settings::default())
            }
        },
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read settings YAML, falling back to defaults"
            );
            Ok(Settings::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn missing_settings_file_falls_back_to_defaults() {
        let settings = load_settings("/does/not/exist.yaml").unwrap();
        assert_eq!(settings.queue.max_retries, 3);
        assert_eq!(settings.queue.batch_size, 20);
        assert_eq!(settings.learning.lr_discrete, default_lr_discrete());
        assert_eq!(settings.embeddings.dim, default_embedding_dim());
        settings.validate().unwrap();
    }

    #[test]
    fn partial_yaml_merges_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postloop.yaml");
        {
            let mut file = File::create(&path).unwrap();
            writeln!(file, "learning:\n  baseline_beta: 0.25\nqueue:\n  batch_size: 5\n").unwrap();
            file.flush().unwrap();
        }

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.learning.baseline_beta, 0.25);
        assert_eq!(settings.learning.lr_continuous, default_lr_continuous());
        assert_eq!(settings.queue.batch_size, 5);
        assert_eq!(settings.queue.max_retries, default_max_retries());
        assert_eq!(settings.scheduling.platforms, default_platforms());
        assert!(settings.storage.db_path.is_none());
    }

    #[test]
    fn unknown_field_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postloop.yaml");
        std::fs::write(&path, "queue:\n  batchsize: 5\n").unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.queue.batch_size, default_batch_size());
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/postloop.yaml");
        let raw = fs::read_to_string(path).unwrap();
        let settings: Settings = serde_yaml_ng::from_str(&raw).unwrap();
        settings.validate().unwrap();
        let defaults = Settings::default();
        assert_eq!(settings.scheduling.platforms, defaults.scheduling.platforms);
        assert_eq!(settings.scheduling.utc_offset_minutes, 330);
        assert_eq!(settings.queue.reward_poll_secs, defaults.queue.reward_poll_secs);
        assert_eq!(settings.queue.claim_lease_secs, defaults.queue.claim_lease_secs);
        assert_eq!(settings.embeddings.dim, defaults.embeddings.dim);
    }

    #[test]
    fn validate_rejects_degenerate_beta() {
        let mut settings = Settings::default();
        settings.learning.baseline_beta = 1.0;
        assert!(matches!(
            settings.validate(),
            Err(PostloopError::Configuration(_))
        ));

        settings.learning.baseline_beta = 0.1;
        settings.queue.max_retries = 0;
        assert!(settings.validate().is_err());

        settings.queue.max_retries = 3;
        settings.queue.claim_lease_secs = 0;
        assert!(settings.validate().is_err());
    }
}
