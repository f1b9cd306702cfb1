//! CLI command implementations.
//!
//! | Module      | Commands handled                         |
//! |-------------|------------------------------------------|
//! | `run`       | `Run`, `Phase`, `Cleanup`                |
//! | `resources` | `Allocate`, `Conflicts`                  |
//! | `monitor`   | `Status`, `Health`, `Serve`              |
//! | `config`    | `Config`                                 |

pub mod config;
pub mod monitor;
pub mod resources;
pub mod run;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;

use adw::config::AdwConfig;
use adw::logging::{init_tracing, level_for};
use adw::tracker::{GhCliTracker, IssueTracker, MemoryTracker};

use super::Cli;

pub use config::cmd_config;
pub use monitor::{cmd_health, cmd_serve, cmd_status};
pub use resources::{cmd_allocate, cmd_conflicts};
pub use run::{RunOptions, cmd_cleanup, cmd_phase, cmd_run};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Load configuration and install logging. Long-running commands also log
/// to `.adw/logs/`.
fn setup(cli: &Cli, project_dir: &Path, log_to_file: bool) -> Result<(AdwConfig, Option<WorkerGuard>)> {
    let config = AdwConfig::load(project_dir)?;
    let log_dir = log_to_file.then(|| config.log_dir());
    let guard = init_tracing(cli.json_logs, level_for(cli.verbose), log_dir.as_deref());
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }
    Ok((config, guard))
}

fn issue_tracker(no_external: bool) -> Arc<dyn IssueTracker> {
    if no_external {
        Arc::new(MemoryTracker::new())
    } else {
        Arc::new(GhCliTracker::new(None, TRACKER_TIMEOUT))
    }
}
