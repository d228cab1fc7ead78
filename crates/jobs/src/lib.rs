//! Delayed-reward job pipeline for postloop.
//!
//! Content runs pick an action per post and queue a reward job; reward jobs
//! settle engagement into a reward record and chain a policy update.

pub mod client;
pub mod collaborators;
pub mod cycle;
pub mod job;
pub mod ledger;
pub mod metrics;
pub mod queue;
pub mod reward;
pub mod worker;

pub use client::BackendClient;
pub use collaborators::{
    BrandMetadata, BusinessProfile, Collaborators, ContentGenerator, ContentRequest,
    GeneratedContent, ProfileSource, RewardSource, TopicSource,
};
pub use cycle::{ContentCycle, CycleReport};
pub use job::{Job, JobPayload, JobStatus, NewJob};
pub use ledger::{ActionRecord, Ledger, PostRecord, RewardRecord, SqliteLedger};
pub use metrics::WorkerMetrics;
pub use queue::{JobStore, SqliteJobStore};
pub use reward::{RewardOutcome, RewardPipeline, UpdateOutcome};
pub use worker::{BatchReport, Services, Worker};
