use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mnr_core::RegionCode;
use mnr_storage::PgDocumentStore;
use mnr_sync::{
    pipeline_from_env, NewRewardWatcher, NotificationDispatcher, NotifyConfig, SyncPipeline,
};
use mnr_web::{serve, topic_manager_from_config, web_port_from_env, AppState};
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mnr-cli")]
#[command(about = "My Nintendo rewards sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every eligible region once, announce new rewards and print the run summary.
    Sync {
        /// Only this region, even when it is disabled.
        #[arg(long)]
        region: Option<String>,
    },
    /// Scheduled syncs plus new-reward notifications.
    Watch,
    /// Serve the JSON API; with MNR_SCHEDULER_ENABLED also sync and notify.
    Serve,
    /// Scheduler, notifications and the JSON API in one process.
    Run,
    /// Apply database migrations to DATABASE_URL.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("MNR_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn new_reward_watcher(pipeline: &SyncPipeline) -> Result<NewRewardWatcher> {
    let dispatcher = NotificationDispatcher::from_config(&NotifyConfig::from_env())?;
    info!(backends = ?dispatcher.backend_names(), "notification dispatcher ready");
    Ok(NewRewardWatcher::new(dispatcher, pipeline.config().site_url.clone()))
}

/// Watcher first, so the scheduler's first write is already observed.
async fn start_background(pipeline: Arc<SyncPipeline>, sched: JobScheduler) -> Result<JobScheduler> {
    let store = pipeline.store();
    new_reward_watcher(&pipeline)?.spawn(store.as_ref());

    sched.start().await.context("starting scheduler")?;
    Ok(sched)
}

fn app_state(pipeline: &SyncPipeline) -> Result<AppState> {
    Ok(AppState::new(
        pipeline.store(),
        pipeline.registry().clone(),
        topic_manager_from_config(&NotifyConfig::from_env())?,
    ))
}

async fn shutdown(mut sched: JobScheduler) -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    if let Err(err) = sched.shutdown().await {
        warn!(error = %err, "scheduler shutdown failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { region: None }) {
        Commands::Sync { region } => {
            let region = region.map(RegionCode::new);
            let pipeline = pipeline_from_env().await?;
            let watcher = new_reward_watcher(&pipeline)?;
            let (summary, sent) = pipeline.run_once_notifying(region.as_ref(), &watcher).await?;
            info!(notifications = sent.len(), "sync finished");
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.failed.is_empty() && summary.succeeded.is_empty() {
                anyhow::bail!("every region failed to sync");
            }
        }
        Commands::Watch => {
            let pipeline = Arc::new(pipeline_from_env().await?);
            let sched = Arc::clone(&pipeline).build_scheduler().await?;
            let sched = start_background(pipeline, sched).await?;
            shutdown(sched).await?;
        }
        Commands::Serve => {
            let pipeline = Arc::new(pipeline_from_env().await?);
            let state = app_state(&pipeline)?;
            match Arc::clone(&pipeline).maybe_build_scheduler().await? {
                Some(sched) => {
                    let sched = start_background(pipeline, sched).await?;
                    tokio::select! {
                        served = serve(state, web_port_from_env()) => served?,
                        stopped = shutdown(sched) => stopped?,
                    }
                }
                None => serve(state, web_port_from_env()).await?,
            }
        }
        Commands::Run => {
            let pipeline = Arc::new(pipeline_from_env().await?);
            let state = app_state(&pipeline)?;
            let sched = Arc::clone(&pipeline).build_scheduler().await?;
            let sched = start_background(pipeline, sched).await?;
            tokio::select! {
                served = serve(state, web_port_from_env()) => served?,
                stopped = shutdown(sched) => stopped?,
            }
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
            let store = PgDocumentStore::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
    }

    Ok(())
}
