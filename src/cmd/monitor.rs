//! Monitoring commands: `adw status`, `adw health` and `adw serve`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use console::style;

use adw::config::AdwConfig;
use adw::monitor::{
    DerivedStatus, HealthChecker, RefresherConfig, Severity, StatusAggregator, spawn_refresher,
};
use adw::process::PidFileRegistry;
use adw::server::{AppState, EventBroadcaster, start_server};
use adw::state::WorkflowStateStore;

use super::super::Cli;
use super::{issue_tracker, setup};

/// Broadcast buffer per subscriber; slow subscribers skip to the latest.
const BROADCAST_CAPACITY: usize = 256;

fn aggregator(config: &AdwConfig, no_external: bool) -> StatusAggregator {
    let store = WorkflowStateStore::new(config.state_dir());
    StatusAggregator::new(
        store,
        Arc::new(PidFileRegistry::new(config.state_dir())),
        issue_tracker(no_external),
        config.monitor.stale_after(),
        config.monitor.issue_ttl(),
    )
}

fn health_checker(config: &AdwConfig) -> HealthChecker {
    HealthChecker::new(
        WorkflowStateStore::new(config.state_dir()),
        Arc::new(PidFileRegistry::new(config.state_dir())),
        &config.project_dir,
        config.monitor.clone(),
    )
}

fn styled_status(status: DerivedStatus) -> console::StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        DerivedStatus::Running => s.cyan(),
        DerivedStatus::Paused => s.yellow(),
        DerivedStatus::Failed => s.red(),
        DerivedStatus::Completed => s.green(),
        DerivedStatus::Queued | DerivedStatus::Unknown => s.dim(),
    }
}

fn styled_severity(severity: Severity) -> console::StyledObject<&'static str> {
    match severity {
        Severity::Ok => style("ok").green(),
        Severity::Warning => style("warning").yellow(),
        Severity::Critical => style("critical").red().bold(),
    }
}

pub async fn cmd_status(cli: &Cli, project_dir: &Path, json: bool, no_external: bool) -> Result<()> {
    let (config, _guard) = setup(cli, project_dir, false)?;
    let snapshot = aggregator(&config, no_external).snapshot().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let s = &snapshot.summary;
    println!();
    println!(
        "{} total, {} running, {} paused, {} failed, {} completed",
        s.total, s.running, s.paused, s.failed, s.completed
    );
    if snapshot.workflows.is_empty() {
        println!("No workflows found in {}", config.state_dir().display());
        return Ok(());
    }
    println!();
    println!(
        "{:<10} {:<8} {:<10} {:<10} {:>5}  Ports",
        "ADW ID", "Issue", "Status", "Phase", "Done"
    );
    for view in &snapshot.workflows {
        let ports = match (view.backend_port, view.frontend_port) {
            (Some(b), Some(f)) => format!("{}/{}", b, f),
            _ => "-".to_string(),
        };
        println!(
            "{:<10} {:<8} {:<10} {:<10} {:>4}%  {}{}",
            view.adw_id,
            view.issue_ref.as_deref().unwrap_or("-"),
            styled_status(view.status),
            view.current_phase.map_or("-", |p| p.as_str()),
            view.progress,
            ports,
            if view.stale {
                format!(" {}", style("(stale)").yellow())
            } else {
                String::new()
            }
        );
        if let Some(error) = &view.error {
            println!("           {} {}", style("error:").red(), error);
        }
    }
    Ok(())
}

pub async fn cmd_health(cli: &Cli, project_dir: &Path, adw_id: &str, json: bool) -> Result<()> {
    let (config, _guard) = setup(cli, project_dir, false)?;
    adw::state::validate_adw_id(adw_id)?;
    let report = health_checker(&config).check(adw_id).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("Health of {}: {}", adw_id, styled_severity(report.overall));
    let checks = [
        ("port", &report.checks.port),
        ("worktree", &report.checks.worktree),
        ("state file", &report.checks.state_file),
        ("process", &report.checks.process),
    ];
    for (name, probe) in checks {
        println!("  {:<11} {:<8} {}", name, styled_severity(probe.status), probe.details);
    }
    if !report.warnings.is_empty() {
        println!();
        for warning in &report.warnings {
            println!("  {} {}", style("!").yellow(), warning);
        }
    }
    Ok(())
}

pub async fn cmd_serve(cli: &Cli, project_dir: &Path, port: Option<u16>, no_external: bool) -> Result<()> {
    let (config, _guard) = setup(cli, project_dir, true)?;
    let store = WorkflowStateStore::new(config.state_dir());

    let (snapshots, refresher) = spawn_refresher(
        aggregator(&config, no_external),
        RefresherConfig::new(config.monitor.status_ttl(), config.monitor.refresh_interval()),
    );
    let broadcaster = Arc::new(EventBroadcaster::new(store.clone(), snapshots.clone(), BROADCAST_CAPACITY));
    let state = Arc::new(AppState {
        store,
        snapshots,
        health: Arc::new(health_checker(&config)),
        broadcaster,
    });

    let result = start_server(state, port.unwrap_or(config.server.port)).await;
    refresher.abort();
    result
}
