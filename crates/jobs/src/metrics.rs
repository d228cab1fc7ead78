use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobLabels {
    pub job_type: String,
    pub outcome: String,
}

/// Counters for one worker process.
#[derive(Clone, Default)]
pub struct WorkerMetrics {
    jobs_total: Family<JobLabels, Counter>,
    policy_updates_total: Counter,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "postloop_jobs",
            "Jobs processed by outcome",
            self.jobs_total.clone(),
        );
        registry.register(
            "postloop_policy_updates",
            "Policy updates applied from settled rewards",
            self.policy_updates_total.clone(),
        );
    }

    pub fn record_job(&self, job_type: &str, outcome: &str) {
        self.jobs_total
            .get_or_create(&JobLabels {
                job_type: job_type.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn record_policy_update(&self) {
        self.policy_updates_total.inc();
    }

    pub fn jobs(&self, job_type: &str, outcome: &str) -> u64 {
        self.jobs_total
            .get_or_create(&JobLabels {
                job_type: job_type.to_string(),
                outcome: outcome.to_string(),
            })
            .get()
    }

    pub fn policy_updates(&self) -> u64 {
        self.policy_updates_total.get()
    }
}

/// Prometheus text exposition of `registry`.
pub fn encode(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut body = String::new();
    prometheus_client::encoding::text::encode(&mut body, registry)?;
    Ok(body)
}
