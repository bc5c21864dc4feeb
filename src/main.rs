use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "forgeflow")]
#[command(version, about = "Issue-driven delivery orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write JSON logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Path to flow.toml
    #[arg(
        short,
        long,
        global = true,
        env = "FORGEFLOW_CONFIG",
        default_value = forgeflow::config::DEFAULT_CONFIG_PATH
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Receive tracker webhooks and drive phase runs
    Serve {
        /// Bind address (overrides [server].host)
        #[arg(long)]
        host: Option<String>,
        /// Port (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Write a starter flow.toml and create the database
    Init {
        /// Overwrite an existing flow.toml
        #[arg(long)]
        force: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Print the status table in lifecycle order
    Statuses,
    /// List pipeline runs
    Runs {
        /// Only runs for this work item
        #[arg(long)]
        item: Option<String>,
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// List pending questions (or those in another state)
    Questions {
        /// pending, answered, timed_out or cancelled
        #[arg(long, default_value = "pending")]
        state: String,
    },
    /// Route a recorded webhook payload as if the tracker had sent it
    Replay {
        /// JSON file holding one tracker event
        event: PathBuf,
        /// Wait for a started run to leave `running`
        #[arg(long)]
        wait: bool,
        /// Seconds to wait with --wait
        #[arg(long, default_value = "300")]
        timeout: u64,
    },
    /// Cancel a running or blocked run
    Cancel { run_id: String },
    /// Expire questions past their deadline
    Sweep,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let _log_guard = forgeflow::logging::init(cli.verbose, cli.log_json, cli.log_dir.as_deref())?;

    match &cli.command {
        Commands::Serve { host, port } => {
            cmd::cmd_serve(&cli.config, host.clone(), *port).await?;
        }
        Commands::Init { force } => cmd::cmd_init(&cli.config, *force)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
        Commands::Statuses => cmd::cmd_statuses(&cli.config)?,
        Commands::Runs { item, limit } => cmd::cmd_runs(&cli.config, item.as_deref(), *limit)?,
        Commands::Questions { state } => cmd::cmd_questions(&cli.config, state)?,
        Commands::Replay { event, wait, timeout } => {
            cmd::cmd_replay(&cli.config, event, *wait, *timeout).await?;
        }
        Commands::Cancel { run_id } => cmd::cmd_cancel(&cli.config, run_id).await?,
        Commands::Sweep => cmd::cmd_sweep(&cli.config).await?,
    }

    Ok(())
}
