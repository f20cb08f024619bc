use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use courier_core::ScheduleRequest;
use courier_runtime::api::{self, ApiState};
use courier_runtime::broker::NatsPublisher;
use courier_runtime::flag::{StopFlag, StopGuard};
use courier_runtime::registry::TaskRegistry;
use courier_runtime::store::PgTaskStore;
use courier_runtime::{Config, Stats, WorkerBuilder};
use sqlx::postgres::PgPoolOptions;
use sqlx::Executor;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, clap::Parser)]
#[command(name = "courier", about = "Durable database-backed message scheduler")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the scheduler service until interrupted.
    Start(StartArgs),
    /// Insert a single schedule request and exit.
    Schedule(ScheduleArgs),
    /// Validate a schedule request without persisting it.
    Parse(ParseArgs),
    /// Print the HTTP API schema.
    Openapi,
}

#[derive(Debug, clap::Args)]
struct StartArgs {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "BROKER_URL")]
    broker_url: String,

    /// Subject to consume schedule requests from. When unset, only the HTTP
    /// endpoint accepts requests.
    #[arg(long, env = "BROKER_SUBSCRIPTION")]
    broker_subscription: Option<String>,

    #[arg(long, env = "MAX_THREADS", default_value_t = 10)]
    max_threads: usize,

    #[arg(long, env = "POLLING_INTERVAL_SECONDS", default_value_t = 10)]
    polling_interval_seconds: u64,

    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    api_port: u16,

    #[arg(long, env = "API_USERNAME")]
    api_username: Option<String>,

    #[arg(long, env = "API_PASSWORD")]
    api_password: Option<String>,
}

#[derive(Debug, clap::Args)]
struct ScheduleArgs {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Read the request JSON from this file instead of stdin.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct ParseArgs {
    /// Read the request JSON from this file instead of stdin.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match args.command {
        Command::Start(args) => start(args).await,
        Command::Schedule(args) => schedule(args).await,
        Command::Parse(args) => parse(args),
        Command::Openapi => {
            println!("{}", serde_json::to_string_pretty(&api::openapi_document())?);
            Ok(())
        }
    }
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    let config = Config::new()
        .max_threads(args.max_threads)
        .batch_size((args.max_threads * 3) as u32)
        .polling_interval(Duration::from_secs(args.polling_interval_seconds));

    let pool = connect_pool(&args.database_url, (args.max_threads + 2) as u32).await?;
    let nats = async_nats::connect(&args.broker_url)
        .await
        .context("failed to connect to the broker")?;

    let shutdown = StopFlag::new();
    let stats = Arc::new(Stats::default());

    let mut worker = WorkerBuilder::new(
        Arc::new(PgTaskStore::new(pool.clone())),
        Arc::new(NatsPublisher::new(nats.clone())),
    )
    .config(config)
    .shutdown(shutdown.clone())
    .stats(stats.clone())
    .build();

    let registry = worker.registry();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("got ctrl-c, shutting down");
            shutdown.raise();
        }
    });

    let api_state = Arc::new(ApiState {
        registry: registry.clone(),
        stats,
        auth: match (args.api_username, args.api_password) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        },
    });

    // Either ingress dying takes the whole service down rather than leaving
    // the worker running with no way to accept requests.
    let api_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let port = args.api_port;
        async move {
            let _guard = StopGuard::new(&shutdown);
            api::serve(api_state, port, shutdown.clone()).await
        }
    });

    let ingest_task = args.broker_subscription.map(|subject| {
        let nats = nats.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _guard = StopGuard::new(&shutdown);
            courier_runtime::ingest::run(nats, subject, registry, shutdown.clone()).await
        })
    });

    let result = worker.run().await;

    if let Some(task) = ingest_task {
        task.await
            .context("ingest task panicked")?
            .context("broker ingress failed")?;
    }
    api_task
        .await
        .context("api task panicked")?
        .context("api server failed")?;

    nats.flush().await.context("failed to flush the broker client")?;
    pool.close().await;

    result
}

async fn schedule(args: ScheduleArgs) -> anyhow::Result<()> {
    let body = read_input(args.file.as_deref())?;
    let now = Utc::now();
    let request = ScheduleRequest::parse(&body, now)
        .map_err(|error| anyhow::anyhow!("invalid schedule request: {error}"))?;

    let pool = connect_pool(&args.database_url, 2).await?;
    let registry = TaskRegistry::new(
        Arc::new(PgTaskStore::new(pool.clone())),
        Arc::new(Stats::default()),
    );

    let id = registry
        .submit(&request, now)
        .await
        .context("failed to schedule the task")?;
    println!("scheduled {id} to fire at {}", request.first_execution_time(now));

    pool.close().await;

    Ok(())
}

fn parse(args: ParseArgs) -> anyhow::Result<()> {
    let body = read_input(args.file.as_deref())?;
    let request = ScheduleRequest::parse(&body, Utc::now())
        .map_err(|error| anyhow::anyhow!("invalid schedule request: {error}"))?;

    println!("{}", serde_json::to_string_pretty(&request.canonical())?);

    Ok(())
}

async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // Keep a wedged statement from outliving the polling cadence.
                conn.execute("SET statement_timeout = '30s'").await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
        .context("failed to connect to the database")
}

fn read_input(file: Option<&std::path::Path>) -> anyhow::Result<Vec<u8>> {
    match file {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
        }
        None => {
            let mut buffer = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buffer)
                .context("failed to read request from stdin")?;
            Ok(buffer)
        }
    }
}
