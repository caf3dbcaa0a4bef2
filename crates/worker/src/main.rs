//! Herald worker - delivers outbox notifications and cleans up settled records.

mod commands;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use herald_outbox::{
    InMemoryOutboxStore, LogDeliveryClient, OutboxConfig, OutboxStoreError, PostgresOutboxStore,
    Reauthorizing,
};
use tracing::{info, warn};

use crate::commands::Command;

/// Herald worker command-line interface.
#[derive(Parser)]
#[command(name = "herald-worker")]
#[command(about = "Notification outbox dispatcher and garbage collector")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Postgres connection string. The in-memory store is used when unset.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    database_url: Option<String>,

    /// Maximum pooled Postgres connections
    #[arg(long, env = "HERALD_DB_MAX_CONNECTIONS", default_value_t = 5, global = true)]
    max_connections: u32,

    /// Log deliveries instead of sending them, and mark the records processed.
    /// Required for `dispatch` and `run` against Postgres.
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one dispatch cycle
    Dispatch {
        /// Retries allowed after the first failure
        #[arg(long, env = "HERALD_MAX_RETRIES")]
        max_retries: Option<u32>,
        /// Threads used to work through the batch
        #[arg(long, env = "HERALD_DISPATCH_CONCURRENCY")]
        concurrency: Option<usize>,
    },
    /// Run one garbage collection cycle
    Gc {
        /// Delete processed records older than this many days
        #[arg(long, env = "HERALD_RETENTION_DAYS")]
        retention_days: Option<u32>,
    },
    /// Run dispatch and garbage collection on their intervals until Ctrl-C
    Run,
    /// Print record counts per processing status
    Stats,
    /// List dead-lettered records
    Dlq {
        /// Show at most this many records
        #[arg(long)]
        limit: Option<usize>,
    },
}

impl Commands {
    /// Fold command-line overrides into the environment configuration.
    fn resolve(self, mut config: OutboxConfig) -> anyhow::Result<(Command, OutboxConfig)> {
        let command = match self {
            Commands::Dispatch {
                max_retries,
                concurrency,
            } => {
                if let Some(max_retries) = max_retries {
                    config.max_retries = max_retries;
                }
                if let Some(concurrency) = concurrency {
                    config.dispatch_concurrency = concurrency;
                }
                Command::Dispatch
            }
            Commands::Gc { retention_days } => {
                if let Some(days) = retention_days {
                    config.retention_days = days;
                }
                Command::Gc
            }
            Commands::Run => Command::Run,
            Commands::Stats => Command::Stats,
            Commands::Dlq { limit } => Command::Dlq { limit },
        };
        config.validate()?;
        Ok((command, config))
    }
}

/// Commands that settle records need `--dry-run` against Postgres; the only wired
/// client logs deliveries instead of sending them.
fn check_delivery(
    command: &Command,
    database_url: Option<&str>,
    dry_run: bool,
) -> anyhow::Result<()> {
    if command.delivers() && database_url.is_some() && !dry_run {
        bail!(
            "refusing to deliver from the Postgres outbox without a delivery client; \
             pass --dry-run to log deliveries and mark them processed"
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    herald_observability::init();

    let env_config = OutboxConfig::from_env().context("invalid outbox configuration")?;
    let (command, config) = cli.command.resolve(env_config)?;
    check_delivery(&command, cli.database_url.as_deref(), cli.dry_run)?;
    if cli.dry_run {
        warn!("dry run: deliveries are logged, not sent");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let wait_for_shutdown = || {
        runtime
            .block_on(tokio::signal::ctrl_c())
            .context("failed to listen for Ctrl-C")
    };
    let client = Reauthorizing::new(LogDeliveryClient::new());

    let output = match cli.database_url.as_deref() {
        Some(url) => {
            let store = runtime
                .block_on(async {
                    let store = PostgresOutboxStore::connect(url, cli.max_connections).await?;
                    store.ensure_schema().await?;
                    Ok::<_, OutboxStoreError>(store)
                })
                .context("failed to open postgres outbox store")?;
            info!(max_connections = cli.max_connections, "using postgres outbox store");
            commands::execute(store, client, &config, command, wait_for_shutdown)?
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory outbox store");
            commands::execute(
                InMemoryOutboxStore::arc(),
                client,
                &config,
                command,
                wait_for_shutdown,
            )?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
