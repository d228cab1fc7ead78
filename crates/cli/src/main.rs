use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use policy::utils::events::EventLog;
use policy::utils::policy_store::load_snapshot;
use postloop_core::{db, load_settings, Settings};
use postloop_embeddings::OllamaEmbedder;
use postloop_jobs::cycle::{bootstrap, schedule_now};
use postloop_jobs::{BackendClient, Collaborators, JobStatus, JobStore, Services, SqliteJobStore, Worker, WorkerMetrics};
use prometheus_client::registry::Registry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "postloop", version, about = "postloop: Bandit für Post-Kreativität mit verzögerter Belohnung")]
struct Cli {
    /// Mehr Logausgabe
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Pfad zur Konfiguration (sonst $POSTLOOP_CONFIG oder ./configs/postloop.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Einen Stapel fälliger Jobs abarbeiten
    RunOnce {
        /// Zähler im Prometheus-Textformat ausgeben
        #[arg(long)]
        metrics: bool,
    },
    /// Content-Lauf für ein Business sofort einplanen
    Schedule { business_id: String },
    /// Content-Lauf für alle bekannten Profile einplanen
    Bootstrap,
    /// Jobs anzeigen
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Gelernte Präferenzen anzeigen
    Policy {
        #[arg(long)]
        platform: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn settings_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| {
        std::env::var("POSTLOOP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./configs/postloop.yaml"))
    })
}

fn collaborators(settings: &Settings) -> anyhow::Result<Collaborators> {
    let timeout = Duration::from_secs(settings.backend.timeout_secs);
    let backend = BackendClient::new(&settings.backend.base_url, timeout)?;
    let embed_url = Url::parse(&settings.embeddings.base_url)
        .with_context(|| format!("invalid embeddings.base_url {}", settings.embeddings.base_url))?;
    let embedder = OllamaEmbedder::new(embed_url, settings.embeddings.model.clone(), timeout)?;
    Ok(backend.into_collaborators(Arc::new(embedder)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = load_settings(settings_path(&cli))?;
    settings.validate()?;
    let db_path = db::db_path(settings.storage.db_path.clone());
    tracing::debug!(db = %db_path.display(), "using database");

    match cli.command {
        Commands::RunOnce { metrics } => {
            let services = Services::sqlite(&db_path, collaborators(&settings)?, EventLog::in_data_dir())?;
            let worker_metrics = WorkerMetrics::new();
            let mut registry = Registry::default();
            worker_metrics.register(&mut registry);

            let worker = Worker::new(services, &settings).with_metrics(worker_metrics);
            let report = worker.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if metrics {
                print!("{}", postloop_jobs::metrics::encode(&registry)?);
            }
        }
        Commands::Schedule { business_id } => {
            let jobs = SqliteJobStore::open(&db_path)?;
            let (job_id, inserted) = schedule_now(&jobs, &business_id, &settings.scheduling, Utc::now())?;
            if inserted {
                println!("queued {job_id}");
            } else {
                println!("{job_id} already exists");
            }
        }
        Commands::Bootstrap => {
            let jobs = SqliteJobStore::open(&db_path)?;
            let queued = bootstrap(&collaborators(&settings)?, &jobs, &settings.scheduling, Utc::now()).await?;
            for job_id in &queued {
                println!("queued {job_id}");
            }
        }
        Commands::Jobs { status, limit } => {
            let jobs = SqliteJobStore::open(&db_path)?;
            for job in jobs.list(status, limit)? {
                println!(
                    "{:<48} {:<20} {:<10} retries={} run_at={}{}",
                    job.job_id,
                    job.job_type,
                    job.status,
                    job.retry_count,
                    db::format_ts(job.run_at),
                    job.last_error
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Policy { platform } => {
            let snapshot = load_snapshot(db_path, platform).await?;
            for row in &snapshot.preferences {
                println!(
                    "{:<10} {:<10} {:<4} {:<14} {:<22} {:+.4}",
                    row.platform, row.time_bucket, row.day_of_week, row.dimension, row.value, row.preference
                );
            }
            for norm in &snapshot.weight_norms {
                println!("weights {:<14} {:<22} |w|={:.4}", norm.dimension, norm.value, norm.norm);
            }
        }
    }

    Ok(())
}
