//! sempervigil - worker process and operations CLI
//!
//! One binary serves both worker classes (`--class fetch|llm`) plus the
//! operational commands: migrate, enqueue, test-source, CVE sync, and event
//! maintenance. Multiple worker processes coordinate through the shared
//! database; nothing else is shared.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use std::path::PathBuf;
use sv_common::db;
use sv_worker::admin;
use sv_worker::worker::{WorkerClass, WorkerPool};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sempervigil", version, about = "News and vulnerability intelligence worker")]
struct Cli {
    /// Data directory holding the database (env: SV_DATA_DIR)
    #[arg(long, env = "SV_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations and exit
    Migrate,
    /// Run a worker pool
    Worker {
        /// Worker class: fetch or llm
        #[arg(long, default_value = "fetch")]
        class: String,
        /// Drain claimable work and exit instead of polling forever
        #[arg(long)]
        once: bool,
        /// Concurrent worker slots in this process
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Worker id; defaults to the hostname
        #[arg(long, env = "HOSTNAME", default_value = "worker")]
        worker_id: String,
    },
    /// Enqueue a job
    Enqueue {
        job_type: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Fetch and filter a source without persisting anything
    TestSource { source_id: String },
    /// Enqueue a CVE sync now
    CveSync {
        /// Sync a single CVE id instead of the delta window
        #[arg(long)]
        cve_id: Option<String>,
    },
    /// Event maintenance
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
}

#[derive(Subcommand)]
enum EventsCommand {
    /// Enqueue a full events rebuild
    Rebuild,
    /// Purge weak-evidence events now
    Purge,
}

async fn open_pool(data_dir: &PathBuf) -> Result<SqlitePool> {
    let db_path = match std::env::var("SV_DATABASE_URL") {
        Ok(url) => PathBuf::from(url.trim_start_matches("sqlite:")),
        Err(_) => data_dir.join("sempervigil.db"),
    };
    let pool = db::init_pool(&db_path).await.context("database init failed")?;
    db::run_migrations(&pool).await.context("migrations failed")?;
    Ok(pool)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SV_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let pool = open_pool(&cli.data_dir).await?;

    match cli.command {
        Command::Migrate => {
            info!("migrations complete");
        }
        Command::Worker {
            class,
            once,
            concurrency,
            worker_id,
        } => {
            let Some(class) = WorkerClass::parse(&class) else {
                bail!("unknown worker class {class}; expected fetch or llm");
            };
            let pool = WorkerPool::new(pool, class, worker_id, concurrency);
            pool.run(once).await?;
        }
        Command::Enqueue {
            job_type,
            payload,
            priority,
        } => {
            let payload = payload
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("payload must be valid JSON")?;
            let result = admin::enqueue_job(&pool, &job_type, payload, priority).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::TestSource { source_id } => {
            let result = admin::test_source(&pool, &source_id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::CveSync { cve_id } => {
            let result = admin::run_cve_sync_now(&pool, cve_id.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Events { command } => match command {
            EventsCommand::Rebuild => {
                let result = admin::rebuild_events_now(&pool).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            EventsCommand::Purge => {
                let purged = admin::purge_events_now(&pool).await?;
                println!("{{\"purged\": {purged}}}");
            }
        },
    }
    Ok(())
}
