use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use tracksync_core::config::{Config, DEFAULT_CONFIG_FILE};
use tracksync_core::impls::GitHubGateway;
use tracksync_core::lock::RunLock;
use tracksync_core::ports::{Clock, SystemClock};
use tracksync_core::{SyncEngine, SyncReport};

/// tracker.md と GitHub Issues / Projects の双方向同期
#[derive(Debug, Parser)]
#[command(name = "tracksync", version)]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// tracing filter, e.g. `debug` or `tracksync_core=trace`
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile both sides.
    Sync {
        /// Compute and report without changing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the planned operations as JSON.
    Plan,
    /// Print counts per classification.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

/// Ok(false) means the run finished with per-id failures.
async fn run(cli: Cli) -> Result<bool> {
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let gateway = GitHubGateway::from_env(&config).context("creating the GitHub client")?;
    let lock_file = config.lock_file.clone();
    let engine = SyncEngine::builder()
        .config(config)
        .gateway(Arc::new(gateway))
        .build()
        .context("building the sync engine")?;

    match cli.command {
        Command::Sync { dry_run: true } => {
            let report = engine.run(true).await.context("dry run")?;
            Ok(print_report(&report))
        }
        Command::Sync { dry_run: false } => {
            let lock = RunLock::acquire(&lock_file, SystemClock.now())?;
            info!("holding {}", lock.path().display());
            let report = engine.run(false).await.context("sync")?;
            lock.release()?;
            Ok(print_report(&report))
        }
        Command::Plan => {
            let plan = engine.plan().await.context("planning")?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(true)
        }
        Command::Status => {
            let report = engine.status().await.context("status")?;
            Ok(print_report(&report))
        }
    }
}

fn print_report(report: &SyncReport) -> bool {
    println!("{report}");
    report.is_clean()
}
