use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use orbital_core::{DataStore, TaskRegistry};
use orbital_runtime::{Config, Scheduler, Worker};
use orbital_store::PostgresDataStore;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Identity this instance registers schedules/jobs under.
    #[arg(long, env = "ORBITAL_INSTANCE_ID", default_value = "orbital")]
    instance_id: String,

    /// Run the scheduler loop only, without a co-located worker.
    #[arg(long)]
    no_worker: bool,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    lock_expiration_delay: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    max_poll_time: Duration,

    #[arg(long, default_value_t = 100)]
    scheduler_acquire_limit: usize,

    #[arg(long)]
    max_concurrent_jobs: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    let args = Args::parse();

    let pool = sqlx::PgPool::connect(&args.database_url)
        .await
        .context("failed to connect to the database")?;

    let default_config = Config::default();
    let config = Config {
        lock_expiration_delay: args.lock_expiration_delay,
        max_poll_time: args.max_poll_time,
        scheduler_acquire_limit: args.scheduler_acquire_limit,
        max_concurrent_jobs: args.max_concurrent_jobs.unwrap_or(default_config.max_concurrent_jobs),
    };

    let store: Arc<dyn DataStore> = Arc::new(
        PostgresDataStore::open(pool, chrono::Duration::from_std(config.lock_expiration_delay)?)
            .await
            .context("failed to open the Postgres data store")?,
    );

    // Populated by the embedding application before tasks can run; this CLI
    // wires the loops together without registering any of its own.
    let registry = Arc::new(TaskRegistry::new());

    let mut scheduler = Scheduler::new(format!("{}-scheduler", args.instance_id), store.clone(), registry.clone(), config.clone());
    let scheduler_handle = scheduler.handle();

    if args.no_worker {
        tokio::task::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("got Ctrl-C, shutting down");
            scheduler_handle.shutdown();
        });

        tracing::info!("orbital scheduler starting up");
        scheduler.run().await?;
        return Ok(());
    }

    let mut worker = Worker::new(format!("{}-worker", args.instance_id), store.clone(), registry.clone(), config);
    let worker_handle = worker.handle();

    tokio::task::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("got Ctrl-C, shutting down");
        scheduler_handle.shutdown();
        worker_handle.shutdown();
    });

    tracing::info!("orbital scheduler and worker starting up");
    let (scheduler_result, worker_result) = tokio::join!(scheduler.run(), worker.run());
    scheduler_result?;
    worker_result?;
    Ok(())
}
