//! Per-workflow health probes.
//!
//! Four independent probes (ports, worktree, state file, processes) each
//! report a [`Severity`]; the overall verdict is the worst of them. A probe
//! that times out or errors degrades to a warning instead of failing the
//! report.

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::allocator::{ConflictKind, ConflictingWorkflow, find_conflicts};
use crate::config::MonitorConfig;
use crate::errors::StateError;
use crate::process::ProcessRegistry;
use crate::state::{WorkflowState, WorkflowStateStore};
use crate::worktree::inspect_worktree;

use super::cache::{Clock, SystemClock, TtlCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub status: Severity,
    pub details: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ProbeResult {
    fn ok(details: impl Into<String>) -> Self {
        Self {
            status: Severity::Ok,
            details: details.into(),
            warnings: Vec::new(),
        }
    }

    fn critical(details: impl Into<String>) -> Self {
        let details = details.into();
        Self {
            status: Severity::Critical,
            warnings: vec![details.clone()],
            details,
        }
    }

    fn warning(details: impl Into<String>) -> Self {
        let details = details.into();
        Self {
            status: Severity::Warning,
            warnings: vec![details.clone()],
            details,
        }
    }

    /// Raise to warning and note why, unless already worse.
    fn warn(&mut self, message: impl Into<String>) {
        self.status = self.status.max(Severity::Warning);
        self.warnings.push(message.into());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthChecks {
    pub port: ProbeResult,
    pub worktree: ProbeResult,
    pub state_file: ProbeResult,
    pub process: ProbeResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub adw_id: String,
    pub overall: Severity,
    pub checks: HealthChecks,
    pub warnings: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    fn compose(adw_id: &str, checks: HealthChecks) -> Self {
        let all = [&checks.port, &checks.worktree, &checks.state_file, &checks.process];
        let overall = all
            .iter()
            .map(|p| p.status)
            .max()
            .unwrap_or(Severity::Ok);
        let warnings = all.iter().flat_map(|p| p.warnings.iter().cloned()).collect();
        Self {
            adw_id: adw_id.to_string(),
            overall,
            checks,
            warnings,
            checked_at: Utc::now(),
        }
    }
}

/// Await `probe` for at most `limit`; a timeout becomes a warning.
async fn bounded<F>(name: &str, limit: Duration, probe: F) -> ProbeResult
where
    F: Future<Output = ProbeResult>,
{
    match tokio::time::timeout(limit, probe).await {
        Ok(result) => result,
        Err(_) => {
            warn!(probe = name, ?limit, "health probe timed out");
            ProbeResult::warning(format!("{name} probe timed out after {}s", limit.as_secs()))
        }
    }
}

/// Whether something accepts TCP connections on `port` locally.
pub async fn port_listening(port: u16, limit: Duration) -> bool {
    matches!(
        tokio::time::timeout(limit, TcpStream::connect((Ipv4Addr::LOCALHOST, port))).await,
        Ok(Ok(_))
    )
}

pub struct HealthChecker {
    store: WorkflowStateStore,
    registry: Arc<dyn ProcessRegistry>,
    repo_root: PathBuf,
    config: MonitorConfig,
    conflicts: Mutex<TtlCache<String, Vec<ConflictingWorkflow>>>,
}

impl HealthChecker {
    pub fn new(
        store: WorkflowStateStore,
        registry: Arc<dyn ProcessRegistry>,
        repo_root: impl Into<PathBuf>,
        config: MonitorConfig,
    ) -> Self {
        Self::with_clock(store, registry, repo_root, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: WorkflowStateStore,
        registry: Arc<dyn ProcessRegistry>,
        repo_root: impl Into<PathBuf>,
        config: MonitorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ttl = config.port_conflict_ttl();
        Self {
            store,
            registry,
            repo_root: repo_root.into(),
            config,
            conflicts: Mutex::new(TtlCache::with_clock(ttl, clock)),
        }
    }

    pub async fn check(&self, adw_id: &str) -> HealthReport {
        let limit = self.config.probe_timeout();
        let (state_file, state) = self.state_file_probe(adw_id);

        let Some(state) = state else {
            let unavailable = || ProbeResult::warning("state unavailable, probe skipped");
            return HealthReport::compose(
                adw_id,
                HealthChecks {
                    port: unavailable(),
                    worktree: unavailable(),
                    state_file,
                    process: bounded("process", limit, self.process_probe(adw_id)).await,
                },
            );
        };

        let (port, worktree, process) = tokio::join!(
            bounded("port", limit, self.port_probe(&state)),
            bounded("worktree", limit, self.worktree_probe(&state)),
            bounded("process", limit, self.process_probe(adw_id)),
        );
        let report = HealthReport::compose(
            adw_id,
            HealthChecks {
                port,
                worktree,
                state_file,
                process,
            },
        );
        debug!(adw_id, overall = ?report.overall, "health check complete");
        report
    }

    fn state_file_probe(&self, adw_id: &str) -> (ProbeResult, Option<WorkflowState>) {
        let state = match self.store.load(adw_id) {
            Ok(state) => state,
            Err(StateError::NotFound { .. }) => {
                return (ProbeResult::critical("state file does not exist"), None);
            }
            Err(e @ StateError::Corrupt { .. }) => {
                return (ProbeResult::critical(format!("state file is invalid: {e}")), None);
            }
            Err(e) => return (ProbeResult::critical(e.to_string()), None),
        };

        let mut result = ProbeResult::ok(format!("state file valid, status {}", state.status));
        if state.is_live() && !state.status.is_terminal() {
            let missing: Vec<&str> = [
                ("branch_name", state.branch_name.is_none()),
                ("worktree_path", state.worktree_path.is_none()),
                ("backend_port", state.backend_port.is_none()),
                ("frontend_port", state.frontend_port.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();
            if !state.completed_phases.is_empty() && !missing.is_empty() {
                result.warn(format!("state is missing fields: {}", missing.join(", ")));
            }

            let age = self
                .store
                .modified_at(adw_id)
                .and_then(|t| SystemTime::now().duration_since(t).ok());
            if let Some(age) = age
                && age > self.config.stale_after()
            {
                result.warn(format!("state not updated for {}s", age.as_secs()));
            }
        }
        (result, Some(state))
    }

    async fn port_probe(&self, state: &WorkflowState) -> ProbeResult {
        let Some((backend, frontend)) = state.ports() else {
            return ProbeResult::ok("no ports allocated");
        };
        if !state.is_live() {
            return ProbeResult::ok("ports released");
        }

        let conflicts = match self.cached_conflicts(state).await {
            Ok(conflicts) => conflicts,
            Err(e) => {
                return ProbeResult::warning(format!("could not check port conflicts: {e:#}"));
            }
        };
        let port_conflicts: Vec<&ConflictingWorkflow> = conflicts
            .iter()
            .filter(|c| c.kind == ConflictKind::Ports)
            .collect();
        if !port_conflicts.is_empty() {
            let ids: Vec<&str> = port_conflicts.iter().map(|c| c.adw_id.as_str()).collect();
            return ProbeResult::critical(format!(
                "ports {backend}/{frontend} also claimed by {}",
                ids.join(", ")
            ));
        }

        let limit = self.config.probe_timeout();
        let (backend_up, frontend_up) =
            tokio::join!(port_listening(backend, limit), port_listening(frontend, limit));
        let mut result = ProbeResult::ok(format!(
            "backend {backend} {}, frontend {frontend} {}",
            if backend_up { "listening" } else { "idle" },
            if frontend_up { "listening" } else { "idle" },
        ));
        if !backend_up && !frontend_up && self.registry.live_count(&state.adw_id) == 0 {
            result.warn(format!(
                "ports {backend}/{frontend} allocated but unused (stale record?)"
            ));
        }
        result
    }

    async fn cached_conflicts(&self, state: &WorkflowState) -> anyhow::Result<Vec<ConflictingWorkflow>> {
        let key = state.adw_id.clone();
        if let Some(hit) = self.conflicts.lock().ok().and_then(|c| c.get(&key)) {
            return Ok(hit);
        }
        let store = self.store.clone();
        let others = tokio::task::spawn_blocking(move || store.list_all()).await??;
        let found = find_conflicts(state, &others);
        if let Ok(mut cache) = self.conflicts.lock() {
            cache.insert(key, found.clone());
        }
        Ok(found)
    }

    async fn worktree_probe(&self, state: &WorkflowState) -> ProbeResult {
        let Some(ref path) = state.worktree_path else {
            return ProbeResult::ok("no worktree assigned");
        };
        if !state.is_live() {
            return ProbeResult::ok("worktree released");
        }

        let repo_root = self.repo_root.clone();
        let wt_path = PathBuf::from(path);
        let info = match tokio::task::spawn_blocking(move || inspect_worktree(&repo_root, &wt_path)).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => return ProbeResult::warning(format!("could not inspect worktree: {e:#}")),
            Err(e) => return ProbeResult::warning(format!("worktree probe failed: {e}")),
        };

        if !info.exists {
            return ProbeResult::critical(format!("worktree {path} does not exist"));
        }
        let mut result = ProbeResult::ok(format!("worktree {path} present"));
        if !info.registered {
            result.warn(format!("{path} is not registered as a git worktree"));
        }
        if info.uncommitted_changes > 0 {
            result.warn(format!("{} uncommitted change(s)", info.uncommitted_changes));
        }
        result
    }

    async fn process_probe(&self, adw_id: &str) -> ProbeResult {
        let count = self.registry.live_count(adw_id);
        if count > self.config.max_processes {
            let mut result = ProbeResult::ok(format!("{count} executor process(es)"));
            result.warn(format!(
                "{count} executor processes exceed the limit of {} (leaked or duplicate?)",
                self.config.max_processes
            ));
            return result;
        }
        if count == 0 {
            ProbeResult::ok("no executor running")
        } else {
            ProbeResult::ok(format!("{count} executor process(es)"))
        }
    }
}
