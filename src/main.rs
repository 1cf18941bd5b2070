//! tl - calendar-driven task engine.
//!
//! Usage:
//!   tl validate <world>                 Validate a world file
//!   tl schedule <world> [--task] [-n]   Print upcoming instants
//!   tl serve [--config] [--world]       Run the engine and its HTTP API
//!   tl worker --server URL              Run a remote worker

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tideline::api::{self, ApiConfig};
use tideline::{
    EngineConfig, EventBus, ExecutorConfig, InMemoryStorage, LocalExecutor, LoggingHandler,
    Scheduler, Storage, StorageConfig, TaskName, WorkerClient, WorkerConfig, WorkerPool,
    YamlLoader, load_world,
};
use tracing::{error, info, warn};

/// tl - a calendar-driven task engine
#[derive(Parser)]
#[command(name = "tl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a world file without running it
    Validate {
        /// Path to the world file (YAML or JSON)
        #[arg(value_name = "WORLD")]
        world: PathBuf,
    },

    /// Print the upcoming scheduled instants of a world's tasks
    Schedule {
        /// Path to the world file (YAML or JSON)
        #[arg(value_name = "WORLD")]
        world: PathBuf,

        /// Only this task
        #[arg(short, long)]
        task: Option<String>,

        /// Start after this instant (RFC 3339, default: now)
        #[arg(long)]
        after: Option<DateTime<Utc>>,

        /// Number of instants per task
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },

    /// Run the engine and its HTTP API
    Serve {
        /// Engine configuration file (tideline.yaml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// World to submit at startup
        #[arg(short, long)]
        world: Option<PathBuf>,

        /// Tag for the run submitted with --world
        #[arg(long, default_value = "default")]
        tag: String,
    },

    /// Run a remote worker that pulls work from an engine
    Worker {
        /// Base URL of the engine
        #[arg(long, default_value = "http://127.0.0.1:8565")]
        server: String,

        /// Worker name (default: host name)
        #[arg(long)]
        name: Option<String>,

        /// Cores offered to the engine (default: all)
        #[arg(long)]
        cores: Option<u32>,

        /// Milliseconds between polls
        #[arg(long, default_value = "1000")]
        poll_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { world } => {
            validate_world(world)?;
        }
        Commands::Schedule {
            world,
            task,
            after,
            count,
        } => {
            print_schedule(world, task, after.unwrap_or_else(Utc::now), count)?;
        }
        Commands::Serve { config, world, tag } => {
            let config = match config {
                Some(path) => {
                    info!("Loading engine config from: {}", path.display());
                    YamlLoader::load_engine_config(&path)?
                }
                None => EngineConfig::default(),
            };
            serve(config, world, tag).await?;
        }
        Commands::Worker {
            server,
            name,
            cores,
            poll_ms,
        } => {
            run_worker(server, name, cores, poll_ms).await?;
        }
    }

    Ok(())
}

/// Validate a world file.
fn validate_world(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating world: {}", path.display());

    match load_world(&path) {
        Ok(world) => {
            info!("World is valid: {} task(s)", world.len());
            for task in world.tasks() {
                let provides: Vec<&str> = task.provides.iter().map(|r| r.as_str()).collect();
                let requires: Vec<String> = task
                    .requires
                    .iter()
                    .map(|r| match r.offset {
                        0 => r.resource.to_string(),
                        n => format!("{}[{:+}]", r.resource, n),
                    })
                    .collect();
                info!(
                    "  - {}: provides [{}], requires [{}]",
                    task.name,
                    provides.join(", "),
                    requires.join(", ")
                );
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Print upcoming instants, in each task's own timezone.
fn print_schedule(
    path: PathBuf,
    only: Option<String>,
    after: DateTime<Utc>,
    count: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let world = load_world(&path)?;

    if let Some(name) = &only {
        if world.task(&TaskName::new(name)).is_none() {
            return Err(format!("task '{}' not found in {}", name, path.display()).into());
        }
    }

    for task in world.tasks() {
        if only.as_deref().is_some_and(|n| n != task.name.as_str()) {
            continue;
        }
        let tz = task.schedule.timezone();
        println!("{} ({}):", task.name, tz);
        let instants = task.schedule.next_instants(after, count);
        if instants.is_empty() {
            println!("  (no further instants in window)");
        }
        for instant in instants {
            println!("  {}", instant.with_timezone(&tz).to_rfc3339());
        }
    }

    Ok(())
}

/// Build storage from the config and run the engine on it.
async fn serve(
    config: EngineConfig,
    world: Option<PathBuf>,
    tag: String,
) -> Result<(), Box<dyn std::error::Error>> {
    match config.storage.clone() {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; runs are lost on exit");
            serve_with(InMemoryStorage::new(), config, world, tag).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite storage at {}", path);
            let storage = tideline::SqliteStorage::new(&path).await?;
            serve_with(storage, config, world, tag).await
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("this build of tl has no SQLite support; rebuild with --features sqlite".into())
        }
    }
}

async fn serve_with<S: Storage + 'static>(
    storage: S,
    config: EngineConfig,
    world: Option<PathBuf>,
    tag: String,
) -> Result<(), Box<dyn std::error::Error>> {
    // Create event bus with logging handler
    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let mut scheduler = Scheduler::new(storage)
        .with_event_bus(event_bus)
        .with_tick_interval(Duration::from_millis(config.tick_interval_ms))
        .with_shutdown_timeout(Duration::from_secs(config.shutdown_timeout_secs));

    let mut pool = None;
    for executor in &config.executors {
        match executor {
            ExecutorConfig::Local { cores } => {
                info!("Local executor with {} core(s)", cores);
                scheduler = scheduler.with_executor(Arc::new(LocalExecutor::new(*cores)));
            }
            ExecutorConfig::Remote {
                heartbeat_timeout_secs,
            } => {
                info!(
                    "Remote worker pool (heartbeat timeout: {}s)",
                    heartbeat_timeout_secs
                );
                let workers = Arc::new(WorkerPool::new(Duration::from_secs(
                    *heartbeat_timeout_secs,
                )));
                scheduler = scheduler.with_executor(workers.clone());
                pool = Some(workers);
            }
        }
    }

    let recovered = scheduler.recover().await?;
    if !recovered.is_empty() {
        info!("Recovered {} run(s) from storage", recovered.len());
    }

    info!(
        "Starting engine (tick interval: {}ms)...",
        config.tick_interval_ms
    );
    let (handle, scheduler_task) = scheduler.start().await;

    if let Some(path) = world {
        let world = load_world(&path)?;
        let run_id = handle.submit(tag, world).await?;
        info!("Submitted {} as run {}", path.display(), run_id);
    }

    let state = api::create_api_state(handle.clone(), pool);
    let server = api::start_server(ApiConfig::from(&config.server), state).await?;
    info!("Press Ctrl+C to stop");

    // Wait for Ctrl+C
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Engine stopped");
        }
    }

    server.abort();
    info!("Goodbye!");
    Ok(())
}

/// Register with an engine and run its orders until Ctrl+C.
async fn run_worker(
    server: String,
    name: Option<String>,
    cores: Option<u32>,
    poll_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = name
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "worker".to_string());
    let cores = cores.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    });

    info!("Worker '{}' offering {} core(s) to {}", name, cores, server);
    let client = WorkerClient::new(WorkerConfig {
        server,
        name,
        cores,
        poll_interval: Duration::from_millis(poll_ms),
    });

    client
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down worker...");
        })
        .await?;

    info!("Goodbye!");
    Ok(())
}
