//! Derived workflow status, progress and the aggregate snapshot.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::StateError;
use crate::phase::{CANONICAL_PHASES, Phase, WorkflowTemplate};
use crate::process::ProcessRegistry;
use crate::state::{WorkflowState, WorkflowStateStore, WorkflowStatus};
use crate::tracker::{IssueState, IssueTracker};

use super::cache::{Clock, SystemClock, TtlCache};

/// Status shown to observers, derived from the record plus live signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivedStatus {
    Running,
    Paused,
    Failed,
    Completed,
    Queued,
    /// Derivation failed for this workflow.
    Unknown,
}

impl DerivedStatus {
    /// Presentation order; lower sorts first.
    pub fn priority(&self) -> u8 {
        match self {
            DerivedStatus::Running => 0,
            DerivedStatus::Paused => 1,
            DerivedStatus::Failed => 2,
            DerivedStatus::Completed => 3,
            DerivedStatus::Queued | DerivedStatus::Unknown => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedStatus::Running => "running",
            DerivedStatus::Paused => "paused",
            DerivedStatus::Failed => "failed",
            DerivedStatus::Completed => "completed",
            DerivedStatus::Queued => "queued",
            DerivedStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DerivedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything [`determine_status`] looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInputs {
    pub persisted: WorkflowStatus,
    pub process_alive: bool,
    pub worktree_exists: bool,
    /// Only consulted when [`needs_issue_lookup`] says so.
    pub issue_state: Option<IssueState>,
    /// Time since the record was last written.
    pub state_age: Option<Duration>,
    pub stale_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusVerdict {
    pub status: DerivedStatus,
    /// Paused and not written for longer than the staleness threshold.
    pub stale: bool,
}

/// Whether [`determine_status`] will need the issue state. Keeps tracker
/// calls to workflows that have a worktree but no live executor.
pub fn needs_issue_lookup(persisted: WorkflowStatus, process_alive: bool, worktree_exists: bool) -> bool {
    !persisted.is_terminal() && !process_alive && worktree_exists
}

pub fn determine_status(inputs: &StatusInputs) -> StatusVerdict {
    let verdict = |status| StatusVerdict {
        status,
        stale: false,
    };
    match inputs.persisted {
        WorkflowStatus::Completed => return verdict(DerivedStatus::Completed),
        WorkflowStatus::Failed => return verdict(DerivedStatus::Failed),
        WorkflowStatus::Queued | WorkflowStatus::Running | WorkflowStatus::Paused => {}
    }
    if inputs.process_alive {
        return verdict(DerivedStatus::Running);
    }
    if inputs.worktree_exists {
        if inputs.issue_state == Some(IssueState::Closed) {
            return verdict(DerivedStatus::Completed);
        }
        let stale = inputs
            .state_age
            .is_some_and(|age| age > inputs.stale_after);
        return StatusVerdict {
            status: DerivedStatus::Paused,
            stale,
        };
    }
    verdict(DerivedStatus::Queued)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub current_phase: Option<Phase>,
    pub percent: u8,
    pub completed: Vec<Phase>,
}

/// Share of the canonical pipeline done, with half a slot of credit for a
/// phase in flight. When the record names no current phase it is inferred
/// from the newest artifact directory, one slot ahead while the workflow is
/// still active. A completed workflow is always at 100, whatever its template.
pub fn compute_progress(state: &WorkflowState, latest_artifact: Option<Phase>, status: DerivedStatus) -> Progress {
    let active = matches!(status, DerivedStatus::Running | DerivedStatus::Paused);
    let current_phase = state.current_phase.or_else(|| {
        latest_artifact.map(|phase| {
            if active && state.has_completed(phase) {
                phase.next().unwrap_or(phase)
            } else {
                phase
            }
        })
    });

    let slot = 100.0 / CANONICAL_PHASES.len() as f64;
    let mut percent = state.completed_phases.len() as f64 * slot;
    if current_phase.is_some_and(|p| !state.has_completed(p)) {
        percent += slot / 2.0;
    }
    if status == DerivedStatus::Completed {
        percent = 100.0;
    }

    Progress {
        current_phase,
        percent: percent.round().clamp(0.0, 100.0) as u8,
        completed: state.completed_phases.clone(),
    }
}

/// One workflow as presented by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowView {
    pub adw_id: String,
    #[serde(rename = "issue_number")]
    pub issue_ref: Option<String>,
    pub status: DerivedStatus,
    #[serde(default)]
    pub stale: bool,
    pub current_phase: Option<Phase>,
    pub progress: u8,
    pub completed_phases: Vec<Phase>,
    pub workflow_template: Option<WorkflowTemplate>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub backend_port: Option<u16>,
    pub frontend_port: Option<u16>,
    #[serde(rename = "start_time")]
    pub started_at: Option<DateTime<Utc>>,
    pub github_url: Option<String>,
    pub cost: Option<serde_json::Value>,
    pub error: Option<String>,
    pub process_count: usize,
}

impl WorkflowView {
    fn unknown(adw_id: &str, error: String) -> Self {
        Self {
            adw_id: adw_id.to_string(),
            issue_ref: None,
            status: DerivedStatus::Unknown,
            stale: false,
            current_phase: None,
            progress: 0,
            completed_phases: Vec::new(),
            workflow_template: None,
            branch_name: None,
            worktree_path: None,
            backend_port: None,
            frontend_port: None,
            started_at: None,
            github_url: None,
            cost: None,
            error: Some(error),
            process_count: 0,
        }
    }

    /// Total presentation order: status priority, newest start, most progress.
    pub fn sort_key(&self) -> (u8, Reverse<Option<DateTime<Utc>>>, Reverse<u8>) {
        (
            self.status.priority(),
            Reverse(self.started_at),
            Reverse(self.progress),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
}

impl StatusSummary {
    pub fn from_views(views: &[WorkflowView]) -> Self {
        let mut summary = StatusSummary {
            total: views.len(),
            ..Default::default()
        };
        for view in views {
            match view.status {
                DerivedStatus::Running => summary.running += 1,
                DerivedStatus::Completed => summary.completed += 1,
                DerivedStatus::Failed => summary.failed += 1,
                DerivedStatus::Paused => summary.paused += 1,
                DerivedStatus::Queued | DerivedStatus::Unknown => {}
            }
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub summary: StatusSummary,
    pub workflows: Vec<WorkflowView>,
    pub last_updated: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn empty() -> Self {
        Self {
            summary: StatusSummary::default(),
            workflows: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

/// Filesystem facts about one record, gathered in the blocking scan.
#[derive(Debug, Clone, Copy, Default)]
struct DiskFacts {
    worktree_exists: bool,
    state_age: Option<Duration>,
    latest_artifact: Option<Phase>,
}

impl DiskFacts {
    fn gather(store: &WorkflowStateStore, state: &WorkflowState) -> Self {
        Self {
            worktree_exists: state
                .worktree_path
                .as_deref()
                .is_some_and(|p| Path::new(p).is_dir()),
            state_age: store
                .modified_at(&state.adw_id)
                .and_then(|t| SystemTime::now().duration_since(t).ok()),
            latest_artifact: store.latest_artifact_phase(&state.adw_id),
        }
    }
}

type ScannedRecord = (String, Result<(WorkflowState, DiskFacts), StateError>);

/// Scans the store and derives every workflow's presented status.
pub struct StatusAggregator {
    store: WorkflowStateStore,
    registry: Arc<dyn ProcessRegistry>,
    tracker: Arc<dyn IssueTracker>,
    stale_after: Duration,
    issue_cache: TtlCache<String, IssueState>,
}

impl StatusAggregator {
    pub fn new(
        store: WorkflowStateStore,
        registry: Arc<dyn ProcessRegistry>,
        tracker: Arc<dyn IssueTracker>,
        stale_after: Duration,
        issue_ttl: Duration,
    ) -> Self {
        Self::with_clock(store, registry, tracker, stale_after, issue_ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: WorkflowStateStore,
        registry: Arc<dyn ProcessRegistry>,
        tracker: Arc<dyn IssueTracker>,
        stale_after: Duration,
        issue_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            tracker,
            stale_after,
            issue_cache: TtlCache::with_clock(issue_ttl, clock),
        }
    }

    /// Compute a fresh snapshot. Never fails as a whole: a workflow whose
    /// derivation errors is rendered `unknown` with the error attached.
    pub async fn snapshot(&mut self) -> StatusSnapshot {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            let scanned: Result<Vec<ScannedRecord>, StateError> = store.scan().map(|records| {
                records
                    .into_iter()
                    .map(|(adw_id, loaded)| {
                        let loaded = loaded.map(|state| {
                            let facts = DiskFacts::gather(&store, &state);
                            (state, facts)
                        });
                        (adw_id, loaded)
                    })
                    .collect()
            });
            // One registry pass serves the whole refresh.
            (scanned, registry.live_counts())
        })
        .await;

        let (scanned, live_counts) = match scanned {
            Ok((Ok(scanned), counts)) => (scanned, counts),
            Ok((Err(e), _)) => {
                warn!(error = %e, "state scan failed");
                (Vec::new(), HashMap::new())
            }
            Err(e) => {
                warn!(error = %e, "state scan task failed");
                (Vec::new(), HashMap::new())
            }
        };

        let mut views = Vec::with_capacity(scanned.len());
        for (adw_id, loaded) in scanned {
            let process_count = live_counts.get(&adw_id).copied().unwrap_or(0);
            let view = match loaded {
                Ok((state, facts)) => self
                    .derive(&state, facts, process_count)
                    .await
                    .unwrap_or_else(|e| WorkflowView::unknown(&adw_id, format!("{e:#}"))),
                Err(e) => WorkflowView::unknown(&adw_id, error_message(&e)),
            };
            views.push(view);
        }
        views.sort_by_key(|v| v.sort_key());
        self.issue_cache.purge();

        debug!(count = views.len(), "computed status snapshot");
        StatusSnapshot {
            summary: StatusSummary::from_views(&views),
            workflows: views,
            last_updated: Utc::now(),
        }
    }

    async fn derive(
        &mut self,
        state: &WorkflowState,
        facts: DiskFacts,
        process_count: usize,
    ) -> anyhow::Result<WorkflowView> {
        let process_alive = process_count > 0;
        let worktree_exists = facts.worktree_exists;

        let issue_state = if needs_issue_lookup(state.status, process_alive, worktree_exists) {
            Some(self.issue_state(&state.issue_ref).await?)
        } else {
            None
        };

        let verdict = determine_status(&StatusInputs {
            persisted: state.status,
            process_alive,
            worktree_exists,
            issue_state,
            state_age: facts.state_age,
            stale_after: self.stale_after,
        });
        let progress = compute_progress(state, facts.latest_artifact, verdict.status);

        Ok(WorkflowView {
            adw_id: state.adw_id.clone(),
            issue_ref: Some(state.issue_ref.clone()),
            status: verdict.status,
            stale: verdict.stale,
            current_phase: progress.current_phase,
            progress: progress.percent,
            completed_phases: progress.completed,
            workflow_template: Some(state.workflow_template),
            branch_name: state.branch_name.clone(),
            worktree_path: state.worktree_path.clone(),
            backend_port: state.backend_port,
            frontend_port: state.frontend_port,
            started_at: state.started_at,
            github_url: state.github_url.clone(),
            cost: state.cost.clone(),
            error: state.error.clone(),
            process_count,
        })
    }

    async fn issue_state(&mut self, issue_ref: &str) -> anyhow::Result<IssueState> {
        let key = issue_ref.to_string();
        if let Some(cached) = self.issue_cache.get(&key) {
            return Ok(cached);
        }
        let fetched = self.tracker.issue_state(issue_ref).await?;
        self.issue_cache.insert(key, fetched);
        Ok(fetched)
    }
}

fn error_message(e: &StateError) -> String {
    match e {
        StateError::Corrupt { source, .. } => format!("corrupt state record: {source}"),
        other => other.to_string(),
    }
}
