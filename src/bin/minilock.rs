//! minilock CLI: take named locks from the shell

use clap::{Parser, Subcommand};
use minilock::common::parse_duration;
use minilock::{Config, Locker, RedisStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minilock")]
#[command(about = "Cluster-wide named locks over a shared Redis store")]
#[command(version)]
struct Cli {
    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store URL (overrides config)
    #[arg(long)]
    redis: Option<String>,

    /// Node ID (overrides config; empty means auto-assigned)
    #[arg(long)]
    node_id: Option<String>,

    /// Directory for the persisted node ID (overrides config)
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a lock and hold it until Ctrl-C
    Hold {
        /// Lock name
        key: String,

        /// Lease (e.g. 30s, 5m); none means the lock never expires
        #[arg(long, value_parser = parse_lease)]
        lease: Option<Duration>,
    },

    /// Try a lock once without waiting
    Try {
        /// Lock name
        key: String,

        #[arg(long, value_parser = parse_lease)]
        lease: Option<Duration>,
    },

    /// Run a command while holding a lock
    Run {
        /// Lock name
        key: String,

        #[arg(long, value_parser = parse_lease)]
        lease: Option<Duration>,

        /// Give up if the lock is not acquired in time
        #[arg(long, value_parser = parse_lease)]
        timeout: Option<Duration>,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Show online nodes and the locks this node holds
    Status,
}

fn parse_lease(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file, then override with CLI arguments
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(redis) = cli.redis {
        config.redis_url = redis;
    }
    if let Some(node_id) = cli.node_id {
        config.locker.node_id = node_id;
    }
    if let Some(runtime_dir) = cli.runtime_dir {
        config.locker.runtime_dir = runtime_dir;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let locker = Locker::initialize(config.locker.clone(), store).await?;

    let outcome = run(&locker, cli.command).await;
    locker.shutdown().await?;
    let code = outcome?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(locker: &Locker, command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Hold { key, lease } => {
            let guard = locker
                .acquire_wait_with_lease(&key, lease.unwrap_or_default())
                .await?;
            tracing::info!("Holding {} as {}, Ctrl-C to release", key, locker.node_id());
            tokio::signal::ctrl_c().await?;
            guard.release().await?;
            tracing::info!("Released {}", key);
            Ok(0)
        }
        Commands::Try { key, lease } => {
            let (guard, acquired) = locker
                .acquire_non_blocking(&key, lease.unwrap_or_default())
                .await?;
            println!("{}: {}", key, if acquired { "acquired" } else { "busy" });
            guard.release().await?;
            Ok(if acquired { 0 } else { 1 })
        }
        Commands::Run {
            key,
            lease,
            timeout,
            command,
        } => {
            let cancel = CancellationToken::new();
            if let Some(timeout) = timeout {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    cancel.cancel();
                });
            }
            let (guard, timed_out) = locker
                .acquire_wait_context(&cancel, &key, lease.unwrap_or_default())
                .await?;
            if timed_out {
                tracing::warn!("Timed out waiting for {}", key);
                return Ok(1);
            }

            let (program, args) = command
                .split_first()
                .ok_or_else(|| anyhow::anyhow!("missing command"))?;
            let status = tokio::process::Command::new(program)
                .args(args)
                .status()
                .await;
            guard.release().await?;
            Ok(status?.code().unwrap_or(1))
        }
        Commands::Status => {
            let status = serde_json::json!({
                "node_id": locker.node_id(),
                "online": locker.online_nodes().await?,
                "held": locker.held_keys().await?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(0)
        }
    }
}
