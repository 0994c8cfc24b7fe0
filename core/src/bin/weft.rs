//! Command-line entry point for weft workers.
//!
//! # Usage
//!
//! ```bash
//! # Run a worker with the built-in handlers
//! weft worker --task tcp://10.0.0.1:23812 --result tcp://10.0.0.1:23813 \
//!     --announce tcp://10.0.0.1:23811 --n-workers 8
//!
//! # Watch a master's announcements
//! weft listen --announce tcp://10.0.0.1:23811 --count 3
//! ```

use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use weft_core::client::AnnouncementSubscriber;
use weft_core::config::parse_seconds;
use weft_core::{Endpoint, Endpoints, WorkManagerConfig, Worker, builtin_handlers};

/// Weft work manager
#[derive(Parser, Debug)]
#[command(name = "weft", version)]
#[command(about = "Master/worker task distribution")]
struct Cli {
    /// Log level used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker until the master shuts down or Ctrl-C (twice to skip draining)
    Worker(WorkerArgs),
    /// Print announcements from a master
    Listen(ListenArgs),
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Task distribution endpoint (defaults to WEFT_TASK_ENDPOINT)
    #[arg(long)]
    task: Option<Endpoint>,

    /// Result collection endpoint (defaults to WEFT_RESULT_ENDPOINT)
    #[arg(long)]
    result: Option<Endpoint>,

    /// Announcement endpoint (defaults to WEFT_ANNOUNCE_ENDPOINT)
    #[arg(long)]
    announce: Option<Endpoint>,

    /// Execution pool size
    #[arg(long)]
    n_workers: Option<usize>,

    /// Master ping period in seconds
    #[arg(long, value_parser = seconds)]
    heartbeat_interval: Option<Duration>,

    /// Worker heartbeat period in seconds
    #[arg(long, value_parser = seconds)]
    worker_heartbeat_interval: Option<Duration>,

    /// Missed heartbeat periods before a peer is presumed dead
    #[arg(long)]
    timeout_factor: Option<u32>,

    /// Worker id announced to the master
    #[arg(long)]
    worker_id: Option<String>,
}

#[derive(Args, Debug)]
struct ListenArgs {
    /// Announcement endpoint
    #[arg(long)]
    announce: Endpoint,

    /// Stop after this many announcements
    #[arg(long)]
    count: Option<usize>,

    /// Seconds to keep retrying the connection
    #[arg(long, default_value = "30", value_parser = seconds)]
    connect_timeout: Duration,
}

fn seconds(raw: &str) -> Result<Duration, String> {
    parse_seconds("value", raw).map_err(|e| e.to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Worker(args) => run_worker(args),
        Command::Listen(args) => listen(args),
    }
}

fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = WorkManagerConfig::from_env()?;
    if let Some(endpoint) = args.task {
        config.task_endpoint = Some(endpoint);
    }
    if let Some(endpoint) = args.result {
        config.result_endpoint = Some(endpoint);
    }
    if let Some(endpoint) = args.announce {
        config.announce_endpoint = Some(endpoint);
    }
    if let Some(n_workers) = args.n_workers {
        config.n_workers = n_workers;
    }
    if let Some(interval) = args.heartbeat_interval {
        config.heartbeat_interval = interval;
    }
    if let Some(interval) = args.worker_heartbeat_interval {
        config.worker_heartbeat_interval = interval;
    }
    if let Some(factor) = args.timeout_factor {
        config.timeout_factor = factor;
    }
    config.validate()?;
    let endpoints: Endpoints = config.endpoints()?;

    let mut worker = Worker::new(config, endpoints, builtin_handlers());
    if let Some(worker_id) = args.worker_id {
        worker = worker.with_worker_id(worker_id);
    }
    worker.install_interrupt_handler()?;
    worker.startup()?;
    let exit = worker.wait()?;
    tracing::info!("Worker {} exited: {}", worker.worker_id(), exit);
    Ok(())
}

fn listen(args: ListenArgs) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let mut subscriber =
            AnnouncementSubscriber::connect(&args.announce, args.connect_timeout).await?;
        let mut seen = 0usize;
        while args.count.is_none_or(|count| seen < count) {
            tokio::select! {
                announcement = subscriber.recv() => match announcement? {
                    Some(announcement) => {
                        println!("{}", announcement);
                        seen += 1;
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        tracing::info!("Received {} announcements", seen);
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
