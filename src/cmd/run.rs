//! Pipeline commands: `adw run`, `adw phase` and `adw cleanup`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;

use adw::allocator::ResourceAllocator;
use adw::config::AdwConfig;
use adw::orchestrator::{
    HttpSink, NullSink, PhaseOrchestrator, PhaseOutcome, RunRequest, ScriptExecutor, TransitionSink,
};
use adw::phase::{Phase, WorkflowTemplate};
use adw::process::PidFileRegistry;
use adw::state::{WorkflowStateStore, WorkflowStatus};
use adw::worktree::GitWorkspace;

use super::super::Cli;
use super::{issue_tracker, setup};

pub struct RunOptions {
    pub issue: String,
    pub adw_id: Option<String>,
    pub template: WorkflowTemplate,
    pub from: Option<Phase>,
    pub no_external: bool,
    pub skip_e2e: bool,
}

fn build_orchestrator(config: &AdwConfig, no_external: bool, flags: Vec<String>) -> PhaseOrchestrator {
    let store = WorkflowStateStore::new(config.state_dir());
    let allocator = ResourceAllocator::new(store.clone(), config.ports, config.trees_dir());
    let registry = Arc::new(PidFileRegistry::new(config.state_dir()));
    let executor = Arc::new(ScriptExecutor::new(config.executor.clone(), registry));
    let workspace = Arc::new(GitWorkspace::new(&config.project_dir));

    let sink: Arc<dyn TransitionSink> = match (&config.server.notify_url, no_external) {
        (Some(url), false) => Arc::new(HttpSink::new(url)),
        _ => Arc::new(NullSink),
    };

    PhaseOrchestrator::new(store, allocator, workspace, executor, &config.project_dir)
        .with_tracker(issue_tracker(no_external))
        .with_sink(sink)
        .with_retry(config.retry.clone())
        .with_flags(flags)
}

pub async fn cmd_run(cli: &Cli, project_dir: &Path, options: RunOptions) -> Result<()> {
    let (config, _guard) = setup(cli, project_dir, true)?;
    let mut flags = Vec::new();
    if options.skip_e2e {
        flags.push("--skip-e2e".to_string());
    }
    let orchestrator = build_orchestrator(&config, options.no_external, flags);

    let request = RunRequest {
        adw_id: options.adw_id,
        template: options.template,
        from: options.from,
        ..RunRequest::new(&options.issue)
    };

    println!(
        "{} issue {} ({})",
        style("Running").bold().cyan(),
        options.issue,
        options.template
    );

    let summary = orchestrator.run(request).await.context("Workflow did not complete")?;

    println!();
    println!("{} {}", style("Workflow").bold(), summary.adw_id);
    println!("  status:    {}", summary.status);
    println!(
        "  completed: {}",
        summary
            .completed_phases
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    if !summary.skipped_phases.is_empty() {
        println!(
            "  {} {}",
            style("skipped:").yellow(),
            summary
                .skipped_phases
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    if summary.status != WorkflowStatus::Completed {
        anyhow::bail!("Workflow {} ended as {}", summary.adw_id, summary.status);
    }
    Ok(())
}

pub async fn cmd_phase(
    cli: &Cli,
    project_dir: &Path,
    phase: Phase,
    issue: &str,
    adw_id: &str,
    no_external: bool,
) -> Result<()> {
    let (config, _guard) = setup(cli, project_dir, true)?;
    let orchestrator = build_orchestrator(&config, no_external, Vec::new());
    let state = orchestrator.load_or_create(adw_id, issue, WorkflowTemplate::default())?;
    if !state.phase_plan().contains(&phase) {
        anyhow::bail!(
            "Phase {} is not part of workflow {} ({})",
            phase,
            adw_id,
            state.workflow_template
        );
    }

    match orchestrator.run_phase(adw_id, phase).await? {
        PhaseOutcome::Completed { attempts } => {
            println!("{} {} after {} attempt(s)", style("Completed").green(), phase, attempts)
        }
        PhaseOutcome::Skipped { attempts } => println!(
            "{} {} after {} failed attempt(s)",
            style("Skipped").yellow(),
            phase,
            attempts
        ),
        PhaseOutcome::AlreadyCompleted => {
            println!("{} {} already completed", style("Nothing to do:").dim(), phase)
        }
    }
    Ok(())
}

pub async fn cmd_cleanup(cli: &Cli, project_dir: &Path, adw_id: &str, keep_branch: bool) -> Result<()> {
    let (config, _guard) = setup(cli, project_dir, false)?;
    let orchestrator = build_orchestrator(&config, true, Vec::new());
    let report = orchestrator.cleanup(adw_id, keep_branch).await?;

    println!("Released resources for {}", adw_id);
    println!(
        "  worktree: {}",
        if report.worktree_removed { "removed" } else { "not present" }
    );
    println!(
        "  branch:   {}",
        if report.branch_deleted { "deleted" } else { "kept" }
    );
    Ok(())
}
