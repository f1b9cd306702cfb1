use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use adw::phase::{Phase, WorkflowTemplate};

mod cmd;

#[derive(Parser)]
#[command(name = "adw")]
#[command(version, about = "AI developer workflow orchestrator")]
pub struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true, env = "ADW_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow for an issue through every phase of its template
    Run {
        /// Issue number or reference
        issue: String,

        /// Resume or name a workflow instead of generating an id
        #[arg(long)]
        adw_id: Option<String>,

        #[arg(long, default_value = "sdlc")]
        template: WorkflowTemplate,

        /// Start at this phase, skipping earlier pending phases
        #[arg(long)]
        from: Option<Phase>,

        /// Do not talk to the issue tracker or a running monitor
        #[arg(long)]
        no_external: bool,

        /// Pass --skip-e2e through to the phase executor
        #[arg(long)]
        skip_e2e: bool,
    },
    /// Run exactly one phase of an existing or new workflow
    Phase {
        phase: Phase,
        issue: String,
        adw_id: String,

        #[arg(long)]
        no_external: bool,
    },
    /// Claim a worktree path and port pair for a workflow
    Allocate { adw_id: String },
    /// List live workflows sharing ports or a worktree with this one
    Conflicts { adw_id: String },
    /// Remove a workflow's worktree and release its ports
    Cleanup {
        adw_id: String,

        /// Leave the branch in place
        #[arg(long)]
        keep_branch: bool,
    },
    /// Show every workflow's derived status
    Status {
        #[arg(long)]
        json: bool,

        #[arg(long)]
        no_external: bool,
    },
    /// Probe one workflow's ports, worktree, state file and processes
    Health {
        adw_id: String,

        #[arg(long)]
        json: bool,
    },
    /// Serve status, health and live updates over HTTP
    Serve {
        /// Overrides server.port
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        no_external: bool,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default .adw/adw.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            issue,
            adw_id,
            template,
            from,
            no_external,
            skip_e2e,
        } => {
            cmd::cmd_run(
                &cli,
                &project_dir,
                cmd::RunOptions {
                    issue: issue.clone(),
                    adw_id: adw_id.clone(),
                    template: *template,
                    from: *from,
                    no_external: *no_external,
                    skip_e2e: *skip_e2e,
                },
            )
            .await?;
        }
        Commands::Phase {
            phase,
            issue,
            adw_id,
            no_external,
        } => cmd::cmd_phase(&cli, &project_dir, *phase, issue, adw_id, *no_external).await?,
        Commands::Allocate { adw_id } => cmd::cmd_allocate(&cli, &project_dir, adw_id)?,
        Commands::Conflicts { adw_id } => cmd::cmd_conflicts(&cli, &project_dir, adw_id)?,
        Commands::Cleanup {
            adw_id,
            keep_branch,
        } => cmd::cmd_cleanup(&cli, &project_dir, adw_id, *keep_branch).await?,
        Commands::Status { json, no_external } => {
            cmd::cmd_status(&cli, &project_dir, *json, *no_external).await?
        }
        Commands::Health { adw_id, json } => {
            cmd::cmd_health(&cli, &project_dir, adw_id, *json).await?
        }
        Commands::Serve { port, no_external } => {
            cmd::cmd_serve(&cli, &project_dir, *port, *no_external).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
