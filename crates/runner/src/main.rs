#![forbid(unsafe_code)]

mod artifacts;
mod config;
mod defaults;
mod executors;
mod logging;

use anyhow::{Context, bail};
use artifacts::FsArtifactStore;
use clap::{Args, Parser, Subcommand};
use config::{FileConfig, Overrides, RunnerConfig};
use cx_core::{JobId, JobStatus, OriginRef, PersonaDirectory, StageName};
use cx_engine::{
    JobIntake, JobQueue, Pipeline, Reconciler, SqliteJobQueue, Stages, StoreHandle, WorkerPool,
};
use cx_storage::{JobsListRequest, SqliteStore};
use executors::{CommandReplyDelivery, CommandStage};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[derive(Debug, Parser)]
#[command(
    name = "cx_runner",
    version,
    about = "Runs explainer video jobs and reconciles their replies"
)]
struct Cli {
    /// Directory holding cx_jobs.db (default: <repo root>/.cx)
    #[arg(long, env = "CX_STORAGE_DIR", global = true)]
    storage_dir: Option<PathBuf>,
    /// TOML config file (default: <repo root>/cx.toml when present)
    #[arg(long, env = "CX_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, env = "CX_LOG_JSON", global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker pool and the reconciliation loop until ctrl-c
    Serve(ServeArgs),
    /// Create a job and queue it for the workers
    Submit(SubmitArgs),
    /// Show a job with its status history, or list recent jobs
    Status(StatusArgs),
    /// Run a single reconciliation cycle and exit
    Reconcile,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, env = "CX_WORKERS")]
    workers: Option<usize>,
    #[arg(long, env = "CX_POLL_MS")]
    poll_ms: Option<u64>,
    /// Do not start the reconciliation loop
    #[arg(long)]
    no_reconcile: bool,
    #[arg(long, env = "CX_PUBLIC_BASE_URL")]
    public_base_url: Option<String>,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    persona: String,
    #[arg(long)]
    query: String,
    /// External request id, e.g. tweet:42
    #[arg(long)]
    origin: Option<String>,
    #[arg(long, requires = "origin")]
    author: Option<String>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    job_id: Option<String>,
    /// Filter the listing: created, processing, completed or error
    #[arg(long)]
    status: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json);
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("read current dir")?;
    let storage_dir = cli
        .storage_dir
        .unwrap_or_else(|| defaults::default_storage_dir_from_start(&cwd));
    let config_path = cli
        .config
        .or_else(|| defaults::default_config_from_start(&cwd));
    let file = match &config_path {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    match cli.command {
        Command::Serve(args) => {
            let overrides = Overrides {
                workers: args.workers,
                poll_ms: args.poll_ms,
                no_reconcile: args.no_reconcile,
                public_base_url: args.public_base_url,
            };
            serve(&storage_dir, RunnerConfig::resolve(file, overrides)?).await
        }
        Command::Submit(args) => submit(&storage_dir, args).await,
        Command::Status(args) => status(&storage_dir, args).await,
        Command::Reconcile => {
            reconcile_once(&storage_dir, RunnerConfig::resolve(file, Overrides::default())?).await
        }
    }
}

fn open_store(storage_dir: &Path) -> anyhow::Result<StoreHandle> {
    let store = SqliteStore::open(storage_dir)
        .with_context(|| format!("open job store in {}", storage_dir.display()))?;
    Ok(StoreHandle::new(store))
}

fn command_stages(config: &RunnerConfig) -> anyhow::Result<Stages> {
    let stage = |name: StageName| -> anyhow::Result<Arc<CommandStage>> {
        Ok(Arc::new(CommandStage::new(name, config.stage_command(name)?)))
    };
    Ok(Stages {
        explanation: stage(StageName::Explanation)?,
        speech: stage(StageName::Speech)?,
        persona_video: stage(StageName::PersonaVideo)?,
        visuals: stage(StageName::Visuals)?,
        composition: stage(StageName::Composition)?,
    })
}

fn build_reconciler(
    config: &RunnerConfig,
    store: StoreHandle,
) -> anyhow::Result<Option<Reconciler>> {
    let Some(reply) = config.reply.clone() else {
        return Ok(None);
    };
    let personas = match &config.personas_file {
        Some(path) => {
            let personas = PersonaDirectory::load(path)
                .with_context(|| format!("load personas from {}", path.display()))?;
            if personas.is_empty() {
                tracing::warn!(
                    path = %path.display(),
                    "personas file has no named personas; replies use a generic name"
                );
            }
            personas
        }
        None => PersonaDirectory::default(),
    };
    tracing::debug!(personas = personas.len(), "persona directory loaded");
    Ok(Some(Reconciler::new(
        store,
        Arc::new(CommandReplyDelivery::new(reply)),
        Arc::new(FsArtifactStore::new(config.artifacts_dir.clone())),
        Arc::new(personas),
        config.reconcile.clone(),
    )))
}

async fn serve(storage_dir: &Path, config: RunnerConfig) -> anyhow::Result<()> {
    let store = open_store(storage_dir)?;
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        command_stages(&config)?,
        config.pipeline.clone(),
    ));
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(store.clone()));
    let pool = Arc::new(WorkerPool::new(
        queue,
        pipeline,
        store.clone(),
        config.pool.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(pool.run(shutdown_rx.clone()));
    if config.reconcile_enabled {
        match build_reconciler(&config, store.clone())? {
            Some(reconciler) => {
                tasks.spawn(reconciler.run(shutdown_rx.clone()));
            }
            None => tracing::warn!("no [reply] command configured; reconciliation disabled"),
        }
    }
    tracing::info!(
        storage_dir = %storage_dir.display(),
        workers = config.pool.workers,
        "serving"
    );

    tokio::signal::ctrl_c()
        .await
        .context("listen for ctrl-c")?;
    tracing::info!("shutdown requested; finishing in-flight jobs");
    shutdown_tx.send_replace(true);

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "background task ended abnormally");
        }
    }
    Ok(())
}

async fn submit(storage_dir: &Path, args: SubmitArgs) -> anyhow::Result<()> {
    let store = open_store(storage_dir)?;
    let origin = args
        .origin
        .map(|source| OriginRef::try_new(source, args.author))
        .transpose()
        .context("invalid origin")?;
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(store.clone()));
    let intake = JobIntake::new(store, queue);
    let job_id = intake.submit(&args.persona, &args.query, origin).await?;
    print_json(&json!({ "job_id": job_id }))
}

async fn status(storage_dir: &Path, args: StatusArgs) -> anyhow::Result<()> {
    let store = open_store(storage_dir)?;
    if let Some(raw) = args.job_id {
        let job_id = JobId::try_new(raw).context("invalid job id")?;
        let (job, updates) = store
            .call(move |store| {
                let job = store.job_get(&job_id)?;
                let updates = store.job_status_log(&job_id)?;
                Ok((job, updates))
            })
            .await?;
        let history: Vec<Value> = updates
            .iter()
            .map(|update| {
                json!({
                    "at": format_ms(update.created_at_ms),
                    "status": update.status,
                    "message": update.message,
                })
            })
            .collect();
        return print_json(&json!({ "job": job, "history": history }));
    }

    let status = args
        .status
        .as_deref()
        .map(|raw| JobStatus::parse(raw.trim()).with_context(|| format!("unknown status `{raw}`")))
        .transpose()?;
    let request = JobsListRequest {
        status,
        limit: args.limit,
    };
    let (listed, depth) = store
        .call(move |store| Ok((store.jobs_list(request)?, store.queue_depth()?)))
        .await?;
    let jobs: Vec<Value> = listed
        .jobs
        .iter()
        .map(|job| {
            json!({
                "id": job.id,
                "status": job.status,
                "persona_id": job.persona_id,
                "query": job.query,
                "updated_at": format_ms(job.updated_at_ms),
                "reply_posted": job.reply_posted,
            })
        })
        .collect();
    print_json(&json!({
        "jobs": jobs,
        "has_more": listed.has_more,
        "queue": depth,
    }))
}

async fn reconcile_once(storage_dir: &Path, config: RunnerConfig) -> anyhow::Result<()> {
    let store = open_store(storage_dir)?;
    let Some(mut reconciler) = build_reconciler(&config, store)? else {
        bail!("reconcile needs a [reply] command in the config file");
    };
    let report = reconciler.run_cycle().await?;
    print_json(&json!({
        "candidates": report.candidates,
        "delivered": report.delivered,
        "failed": report.failed,
        "exhausted": report.exhausted,
        "claimed_elsewhere": report.claimed_elsewhere,
        "committed_late": report.committed_late,
    }))
}

fn format_ms(ms: i64) -> String {
    let nanos = i128::from(ms) * 1_000_000;
    time::OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|at| at.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("render output")?;
    println!("{rendered}");
    Ok(())
}
