use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use cowork::config::{CliOverrides, CoworkConfig};
use cowork::logging::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "cowork")]
#[command(version, about = "Drives issues to merged pull requests through leased workflows")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file (defaults to .cowork/cowork.toml under the project directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding workflow, event, lock, task and workspace records
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Lease holder identity for this process
    #[arg(long, global = true)]
    pub holder_id: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, inspect and drive workflows
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Inspect and release workflow leases
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Inspect the inbound event queue
    Events {
        #[command(subcommand)]
        command: EventsCommands,
    },
    /// Create workflows for every open issue in a repository
    Scan {
        /// Repository as OWNER/REPO
        repo: String,
    },
    /// Drive all workflows until interrupted
    Run {
        /// Seconds between processing passes
        #[arg(long, default_value = "30")]
        interval: u64,
        /// Also serve the webhook receiver on this address
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum WorkflowCommands {
    /// Create (or find) the workflow for an issue
    Create {
        /// Repository as OWNER/REPO
        repo: String,
        issue: i64,
        #[arg(long)]
        base_branch: Option<String>,
        /// rebase or merge
        #[arg(long)]
        sync_strategy: Option<String>,
        /// Open the pull request as a draft
        #[arg(long)]
        draft: bool,
    },
    /// List workflows
    List {
        /// Only workflows in this state
        #[arg(long)]
        state: Option<String>,
    },
    /// Show one workflow
    Show { id: i64 },
    /// Delete a workflow and its lease
    Delete { id: i64 },
    /// Advance a workflow by at most one step
    Process { id: i64 },
    /// Abort a workflow
    Abort {
        id: i64,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum LockCommands {
    /// Show leases (all, or one workflow's)
    Status { id: Option<i64> },
    /// Release a lease held by this holder
    Unlock {
        id: i64,
        /// Holder to release as (defaults to this process's holder id)
        #[arg(long)]
        holder: Option<String>,
    },
    /// Remove a lease regardless of holder
    ForceUnlock { id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum EventsCommands {
    /// List pending events
    List {
        /// Include processed events
        #[arg(long)]
        all: bool,
    },
    /// Show one event
    Show { id: String },
    /// Mark an event processed
    Mark {
        id: String,
        #[arg(long)]
        workflow: Option<i64>,
        #[arg(long)]
        error: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default cowork.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let overrides = cli.overrides();

    match &cli.command {
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, &overrides, command.clone())?;
        }
        command => {
            let config = CoworkConfig::load(&project_dir, &overrides)?;
            let _log_guard = init_logging(&config.log)?;
            let ctx = cmd::AppContext::open(config)?;
            dispatch(ctx, command).await?;
        }
    }

    Ok(())
}

async fn dispatch(ctx: cmd::AppContext, command: &Commands) -> Result<()> {
    match command {
        Commands::Workflow { command } => cmd::cmd_workflow(&ctx, command.clone()).await,
        Commands::Lock { command } => cmd::cmd_lock(&ctx, command.clone()),
        Commands::Events { command } => cmd::cmd_events(&ctx, command.clone()),
        Commands::Scan { repo } => cmd::cmd_scan(&ctx, repo).await,
        Commands::Run {
            interval,
            listen,
            once,
        } => {
            let options = cmd::RunOptions {
                interval: std::time::Duration::from_secs((*interval).max(1)),
                listen: *listen,
                once: *once,
            };
            cmd::cmd_run(ctx, options).await
        }
        Commands::Config { .. } => Ok(()),
    }
}

impl Cli {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config_path: self.config.clone(),
            data_dir: self.data_dir.clone(),
            holder_id: self.holder_id.clone(),
            verbose: self.verbose,
        }
    }
}
