use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use marigold_config::Settings;
use marigold_orchestration::OrchestrationEngine;
use marigold_services::{
  FlowRunNotifications, LogSender, LoopService, MarkLateRuns, RescheduleStuckPendingTasks,
  Scheduler, spawn_services,
};
use marigold_store::{SqliteStore, Store};
use marigold_work_queues::{QueueSelector, WorkQueueService};
use marigold_worker::{LocalClient, ProcessInfrastructure, Worker};

/// Marigold - scheduled workflow runs, state orchestration and work pools
#[derive(Parser)]
#[command(name = "marigold")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.marigold)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Settings file (default: <data-dir>/marigold.json, if present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the scheduler, late-run, task-timeout and notification loops
  Serve,

  /// Print the runs a pool would hand out right now
  ScheduledRuns {
    #[command(flatten)]
    queues: QueueArgs,

    /// Include runs scheduled up to this many seconds ahead
    #[arg(long, default_value_t = 0)]
    ahead_seconds: i64,

    #[arg(long)]
    limit: Option<usize>,
  },

  /// Poll a pool and launch each claimed run as a child process
  Worker {
    #[command(flatten)]
    queues: QueueArgs,

    #[arg(long, default_value = "marigold-worker")]
    name: String,

    /// Command to launch for each run; the run id is passed in MARIGOLD_RUN_ID
    #[arg(required = true, last = true)]
    command: Vec<String>,
  },
}

#[derive(clap::Args)]
struct QueueArgs {
  /// Work pool name (default pool when omitted)
  #[arg(long)]
  pool: Option<String>,

  /// Queue names to read; every queue in the pool when omitted
  #[arg(long = "queue")]
  queues: Vec<String>,

  /// Read queues whose name starts with this prefix
  #[arg(long = "prefix", conflicts_with_all = ["queues", "pattern"])]
  prefixes: Vec<String>,

  /// Read queues whose name matches this glob
  #[arg(long, conflicts_with = "queues")]
  pattern: Option<String>,
}

impl QueueArgs {
  fn selector(&self) -> Result<QueueSelector> {
    if let Some(pattern) = &self.pattern {
      return Ok(QueueSelector::pattern(pattern)?);
    }
    if !self.prefixes.is_empty() {
      return Ok(QueueSelector::Prefixes(self.prefixes.clone()));
    }
    if !self.queues.is_empty() {
      return Ok(QueueSelector::Names(self.queues.clone()));
    }
    Ok(QueueSelector::All)
  }
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".marigold"),
  };
  let settings = load_settings(cli.config.as_deref(), &data_dir)?;

  let rt = tokio::runtime::Runtime::new()?;
  match cli.command {
    Some(Commands::Serve) => rt.block_on(serve(data_dir, settings)),
    Some(Commands::ScheduledRuns {
      queues,
      ahead_seconds,
      limit,
    }) => rt.block_on(scheduled_runs(data_dir, settings, queues, ahead_seconds, limit)),
    Some(Commands::Worker {
      queues,
      name,
      command,
    }) => rt.block_on(run_worker(data_dir, settings, queues, name, command)),
    None => {
      println!("marigold - use --help to see available commands");
      Ok(())
    }
  }
}

fn init_tracing() {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_env("MARIGOLD_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
    .with(fmt::layer().with_writer(std::io::stderr))
    .init();
}

fn load_settings(config: Option<&Path>, data_dir: &Path) -> Result<Settings> {
  if let Some(path) = config {
    return Settings::from_file(path).context("failed to load settings");
  }
  let default_path = data_dir.join("marigold.json");
  if default_path.exists() {
    return Settings::from_file(&default_path).context("failed to load settings");
  }
  Ok(Settings::default())
}

async fn open_store(data_dir: &Path) -> Result<Arc<dyn Store>> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

  let url = format!("sqlite://{}", data_dir.join("marigold.db").display());
  let store = SqliteStore::connect(&url)
    .await
    .with_context(|| format!("failed to open database: {url}"))?;
  store.migrate().await.context("failed to migrate database")?;
  Ok(Arc::new(store))
}

async fn serve(data_dir: PathBuf, settings: Settings) -> Result<()> {
  let store = open_store(&data_dir).await?;
  let engine = Arc::new(OrchestrationEngine::new(
    store.clone(),
    settings.orchestration.clone(),
  ));

  let services: Vec<Arc<dyn LoopService>> = vec![
    Arc::new(Scheduler::new(store.clone(), settings.scheduler.clone())),
    Arc::new(MarkLateRuns::new(engine.clone(), settings.late_runs.clone())),
    Arc::new(RescheduleStuckPendingTasks::new(
      engine.clone(),
      settings.task_scheduling.clone(),
    )),
    Arc::new(FlowRunNotifications::new(
      store.clone(),
      Arc::new(LogSender),
      settings.notifications.clone(),
    )),
  ];

  let cancel = CancellationToken::new();
  let mut loops = spawn_services(services, &cancel);
  info!(data_dir = %data_dir.display(), "marigold services started");

  tokio::signal::ctrl_c()
    .await
    .context("failed to listen for shutdown signal")?;
  info!("shutting down");
  cancel.cancel();
  while loops.join_next().await.is_some() {}
  Ok(())
}

async fn scheduled_runs(
  data_dir: PathBuf,
  settings: Settings,
  queues: QueueArgs,
  ahead_seconds: i64,
  limit: Option<usize>,
) -> Result<()> {
  let store = open_store(&data_dir).await?;
  let service = WorkQueueService::new(store, settings.work_queues);
  let scheduled_before = Utc::now() + Duration::seconds(ahead_seconds);

  let runs = match queues.selector()? {
    QueueSelector::All => {
      service
        .get_scheduled_runs_for_pool(queues.pool.as_deref(), &[], scheduled_before, limit)
        .await?
    }
    QueueSelector::Names(names) => {
      service
        .get_scheduled_runs_for_pool(queues.pool.as_deref(), &names, scheduled_before, limit)
        .await?
    }
    selector => {
      let pool = service.read_or_create_pool(queues.pool.as_deref()).await?;
      let mut matcher = service.matcher(selector);
      service
        .poll(&pool, &mut matcher, scheduled_before, limit)
        .await?
    }
  };

  println!("{}", serde_json::to_string_pretty(&runs)?);
  Ok(())
}

async fn run_worker(
  data_dir: PathBuf,
  settings: Settings,
  queues: QueueArgs,
  name: String,
  command: Vec<String>,
) -> Result<()> {
  let store = open_store(&data_dir).await?;
  let engine = Arc::new(OrchestrationEngine::new(
    store.clone(),
    settings.orchestration.clone(),
  ));
  let client = LocalClient::new(engine, WorkQueueService::new(store, settings.work_queues));

  let worker = Worker::new(
    name,
    queues.pool.clone(),
    queues.selector()?,
    settings.worker,
    Arc::new(client),
    Arc::new(ProcessInfrastructure::new(command)),
  );

  let cancel = CancellationToken::new();
  let shutdown = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      shutdown.cancel();
    }
  });

  worker.start(cancel).await.context("worker stopped with an error")
}
