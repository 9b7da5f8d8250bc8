//! fabricd — the fabric twin daemon.
//!
//! Loads an engine config and a fabric descriptor, then runs one of:
//! - `snapshot`: print the current snapshot (after replaying an override log)
//! - `plan`: plan one or more jobs and print the outcomes
//! - `watch`: tail the override log until Ctrl-C, printing each new version
//!
//! # Usage
//!
//! ```text
//! fabricd --fabric fabric.toml plan --job etl.toml --strategy federated
//! fabricd --fabric fabric.toml --config engine.toml watch --overrides overrides.jsonl
//! ```

mod commands;
mod watch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fabric_core::EngineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,fabricd=debug,fabric=debug";

#[derive(Parser)]
#[command(name = "fabricd", about = "Fabric digital twin daemon")]
struct Cli {
    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Fabric descriptor (TOML or JSON).
    #[arg(long, global = true, default_value = "fabric.toml")]
    fabric: PathBuf,

    /// Snapshot archive for policy checkpoints and snapshot history.
    #[arg(long, global = true)]
    archive: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the current fabric snapshot.
    Snapshot {
        /// Override log to replay before printing.
        #[arg(long)]
        overrides: Option<PathBuf>,

        /// Print only the federation overview.
        #[arg(long)]
        overview: bool,
    },
    /// Plan jobs and commit them (or dry-run).
    Plan {
        /// Job descriptor files, planned in order.
        #[arg(long = "job", required = true)]
        jobs: Vec<PathBuf>,

        /// Strategy name or alias.
        #[arg(long, default_value = "resilient")]
        strategy: String,

        /// Validate without reserving.
        #[arg(long)]
        dry_run: bool,

        /// Override log to replay before planning.
        #[arg(long)]
        overrides: Option<PathBuf>,
    },
    /// Run the override merger until Ctrl-C.
    Watch {
        /// Override log to tail. Falls back to `[merger].override_log`.
        #[arg(long)]
        overrides: Option<PathBuf>,

        /// How often to check for a new snapshot version, in milliseconds.
        #[arg(long, default_value = "500")]
        report_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let engine = commands::open_engine(&cli.fabric, config, cli.archive.as_deref())?;
    info!(
        fabric = %cli.fabric.display(),
        version = engine.store().version(),
        "fabric loaded"
    );

    match cli.command {
        Command::Snapshot {
            overrides,
            overview,
        } => commands::snapshot(&engine, overrides.as_deref(), overview).await,
        Command::Plan {
            jobs,
            strategy,
            dry_run,
            overrides,
        } => commands::plan(&engine, &jobs, &strategy, dry_run, overrides.as_deref()).await,
        Command::Watch {
            overrides,
            report_ms,
        } => watch::run(engine, overrides, report_ms).await,
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
