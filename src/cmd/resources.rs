//! Resource commands: `adw allocate` and `adw conflicts`.

use std::path::Path;

use anyhow::Result;
use console::style;

use adw::allocator::{ConflictKind, ResourceAllocator};
use adw::state::WorkflowStateStore;

use super::super::Cli;
use super::setup;

fn allocator_for(cli: &Cli, project_dir: &Path) -> Result<ResourceAllocator> {
    let (config, _guard) = setup(cli, project_dir, false)?;
    let store = WorkflowStateStore::new(config.state_dir());
    Ok(ResourceAllocator::new(store, config.ports, config.trees_dir()))
}

pub fn cmd_allocate(cli: &Cli, project_dir: &Path, adw_id: &str) -> Result<()> {
    let allocator = allocator_for(cli, project_dir)?;
    let allocation = allocator.allocate(adw_id)?;
    println!("{} {}", style("Allocated").green(), adw_id);
    println!("  worktree:      {}", allocation.worktree_path.display());
    println!("  backend port:  {}", allocation.backend_port);
    println!("  frontend port: {}", allocation.frontend_port);
    Ok(())
}

pub fn cmd_conflicts(cli: &Cli, project_dir: &Path, adw_id: &str) -> Result<()> {
    let allocator = allocator_for(cli, project_dir)?;
    let conflicts = allocator.detect_conflicts(adw_id)?;
    if conflicts.is_empty() {
        println!("No conflicts for {}", adw_id);
        return Ok(());
    }

    println!(
        "{} {} conflicting workflow(s):",
        style("Found").yellow().bold(),
        conflicts.len()
    );
    for conflict in &conflicts {
        let what = match conflict.kind {
            ConflictKind::Ports => format!(
                "ports {}/{}",
                conflict.backend_port.map_or("-".to_string(), |p| p.to_string()),
                conflict.frontend_port.map_or("-".to_string(), |p| p.to_string())
            ),
            ConflictKind::Worktree => format!(
                "worktree {}",
                conflict.worktree_path.as_deref().unwrap_or("-")
            ),
        };
        println!("  {:<12} {}", conflict.adw_id, what);
    }
    Ok(())
}
