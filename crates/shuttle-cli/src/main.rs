//! `shuttle` - SQLite に保存した task を操作する CLI
//!
//! 各サブコマンドは Scheduler の操作を 1 回呼び、結果を JSON で stdout に出します。
//! `run` だけは ReaperLoop / GcLoop を起動して Ctrl-C まで待ちます。

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shuttle_core::app::reap_all;
use shuttle_core::domain::{
    DEFAULT_SEARCH_LIMIT, ScheduleId, SearchParams, TaskId, TaskProps, TaskState,
};
use shuttle_core::ports::{SystemClock, TracingEventSink};
use shuttle_core::{GcLoop, ReaperLoop, Scheduler, SchedulerBuilder, SqliteTaskStore};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "shuttle", about = "Durable task scheduler")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Database file (overrides `database_path` from the config).
    #[arg(long = "db")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a task in CREATED.
    Create {
        name: String,
        #[arg(long)]
        group_key: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value_t = 0)]
        group_max_concurrency: u32,
        #[arg(long, default_value_t = 0)]
        retry_max: u32,
        #[arg(long)]
        retry_key: Option<String>,
        /// RFC 3339 timestamp; defaults to now.
        #[arg(long)]
        starts_after: Option<DateTime<Utc>>,
        #[arg(long)]
        created_to_started_timeout_secs: Option<u32>,
        #[arg(long)]
        started_to_completed_timeout_secs: Option<u32>,
        #[arg(long)]
        heartbeat_timeout_secs: Option<u32>,
        #[arg(long)]
        schedule_id: Option<ScheduleId>,
        #[arg(long)]
        owner_key: Option<String>,
    },
    Get {
        id: TaskId,
    },
    Search {
        #[arg(long = "id")]
        ids: Vec<TaskId>,
        #[arg(long)]
        group_key: Option<String>,
        #[arg(long = "state")]
        states: Vec<TaskState>,
        #[arg(long)]
        schedule_id: Option<ScheduleId>,
        #[arg(long)]
        retry_key: Option<String>,
        #[arg(long)]
        owner_key: Option<String>,
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// Claim CREATED tasks for a group key (`*` wildcards allowed).
    Dequeue {
        group_key: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    Heartbeat {
        id: TaskId,
    },
    Succeed {
        id: TaskId,
        /// JSON output.
        #[arg(long, default_value = "null")]
        output: String,
    },
    /// Fail a STARTED task; schedules a retry while the budget allows.
    Fail {
        id: TaskId,
        #[arg(long)]
        error: String,
    },
    Cancel {
        id: TaskId,
        #[arg(long, default_value = "cancelled by user")]
        reason: String,
    },
    /// Run one expiry sweep.
    Expire,
    /// Delete terminated tasks older than `days` (config `retention_days` by default).
    Reap {
        #[arg(long)]
        days: Option<u32>,
    },
    Counts,
    /// Run the expiry and retention loops until Ctrl-C.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    let store = SqliteTaskStore::open(&config.database_path, Arc::new(SystemClock))
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let scheduler = SchedulerBuilder::new(Arc::new(store))
        .event_sink(Arc::new(TracingEventSink))
        .config(config)
        .build()?;

    execute(cli.command, scheduler).await
}

async fn execute(command: Command, scheduler: Scheduler<SqliteTaskStore>) -> anyhow::Result<()> {
    match command {
        Command::Create {
            name,
            group_key,
            payload,
            group_max_concurrency,
            retry_max,
            retry_key,
            starts_after,
            created_to_started_timeout_secs,
            started_to_completed_timeout_secs,
            heartbeat_timeout_secs,
            schedule_id,
            owner_key,
        } => {
            let payload = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut props = TaskProps::new(name, group_key, payload)
                .with_group_max_concurrency(group_max_concurrency)
                .with_retry(retry_max, 0);
            props.retry_key = retry_key;
            props.starts_after = starts_after;
            props.schedule_id = schedule_id;
            props.owner_key = owner_key;
            if let Some(secs) = created_to_started_timeout_secs {
                props.created_to_started_timeout_secs = secs;
            }
            if let Some(secs) = started_to_completed_timeout_secs {
                props.started_to_completed_timeout_secs = secs;
            }
            if let Some(secs) = heartbeat_timeout_secs {
                props.heartbeat_timeout_secs = secs;
            }
            print_json(&scheduler.schedule(props).await?)
        }
        Command::Get { id } => print_json(&scheduler.get(id).await?),
        Command::Search {
            ids,
            group_key,
            states,
            schedule_id,
            retry_key,
            owner_key,
            limit,
        } => {
            let params = SearchParams {
                ids: (!ids.is_empty()).then_some(ids),
                group_key,
                states: (!states.is_empty()).then_some(states),
                schedule_id,
                retry_key,
                owner_key,
                limit: Some(limit),
            };
            print_json(&scheduler.search(&params).await?)
        }
        Command::Dequeue { group_key, limit } => {
            let limit = limit.unwrap_or(scheduler.config().dequeue_limit);
            print_json(&scheduler.dequeue(group_key, limit).await?)
        }
        Command::Heartbeat { id } => print_json(&scheduler.heartbeat(id).await?),
        Command::Succeed { id, output } => {
            let output = serde_json::from_str(&output).context("output is not valid JSON")?;
            print_json(&scheduler.succeed(id, output).await?)
        }
        Command::Fail { id, error } => {
            let outcome = scheduler
                .fail(id, serde_json::json!({ "message": error }))
                .await?;
            print_json(&outcome)
        }
        Command::Cancel { id, reason } => print_json(&scheduler.cancel(id, reason).await?),
        Command::Expire => print_json(&scheduler.expire().await?),
        Command::Reap { days } => {
            let days = days.unwrap_or(scheduler.config().retention_days);
            let deleted = reap_all(&scheduler, days).await?;
            print_json(&serde_json::json!({ "deleted": deleted, "days": days }))
        }
        Command::Counts => print_json(&scheduler.counts().await?),
        Command::Run => run(scheduler).await,
    }
}

async fn run(scheduler: Scheduler<SqliteTaskStore>) -> anyhow::Result<()> {
    let scheduler = Arc::new(scheduler);
    let reaper = ReaperLoop::spawn(Arc::clone(&scheduler));
    let gc = GcLoop::spawn(Arc::clone(&scheduler));
    info!(
        expiry_interval_secs = scheduler.config().expiry_interval_secs,
        gc_interval_secs = scheduler.config().gc_interval_secs,
        retention_days = scheduler.config().retention_days,
        "shuttle running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");

    reaper.shutdown_and_join().await;
    gc.shutdown_and_join().await;
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
