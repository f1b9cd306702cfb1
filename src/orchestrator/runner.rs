use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{info, warn};

use crate::allocator::{Allocation, ResourceAllocator};
use crate::config::RetryConfig;
use crate::errors::{OrchestratorError, StateError};
use crate::phase::{Phase, WorkflowTemplate};
use crate::state::{WorkflowState, WorkflowStateStore, WorkflowStatus, generate_adw_id, validate_adw_id};
use crate::tracker::{IssueTracker, MemoryTracker};
use crate::worktree::{Workspace, branch_name_for};

use super::breaker::LoopDetector;
use super::executor::{ExecutionContext, PhaseExecutor};
use super::sink::{NullSink, PhaseUpdate, TransitionKind, TransitionSink};

const RESULT_FILE_NAME: &str = "result.json";
const EXECUTOR_LOG_NAME: &str = "executor.log";

/// A request to drive one workflow through its plan.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub issue_ref: String,
    /// Existing workflow to resume; a fresh id is generated when absent.
    pub adw_id: Option<String>,
    pub template: WorkflowTemplate,
    /// Start here, skipping earlier pending phases.
    pub from: Option<Phase>,
}

impl RunRequest {
    pub fn new(issue_ref: &str) -> Self {
        Self {
            issue_ref: issue_ref.to_string(),
            adw_id: None,
            template: WorkflowTemplate::default(),
            from: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub adw_id: String,
    pub status: WorkflowStatus,
    pub completed_phases: Vec<Phase>,
    pub skipped_phases: Vec<Phase>,
}

impl RunSummary {
    fn from_state(state: &WorkflowState) -> Self {
        Self {
            adw_id: state.adw_id.clone(),
            status: state.status,
            completed_phases: state.completed_phases.clone(),
            skipped_phases: state.skipped_phases.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed { attempts: u32 },
    /// Non-critical phase that exhausted its retries.
    Skipped { attempts: u32 },
    AlreadyCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CleanupReport {
    pub worktree_removed: bool,
    pub branch_deleted: bool,
}

/// Drives workflows through their phase plan: one executor invocation per
/// attempt, retries by phase criticality, persisted after every transition.
pub struct PhaseOrchestrator {
    store: WorkflowStateStore,
    allocator: ResourceAllocator,
    workspace: Arc<dyn Workspace>,
    executor: Arc<dyn PhaseExecutor>,
    tracker: Arc<dyn IssueTracker>,
    sink: Arc<dyn TransitionSink>,
    retry: RetryConfig,
    detector: LoopDetector,
    flags: Vec<String>,
    project_dir: PathBuf,
}

impl PhaseOrchestrator {
    pub fn new(
        store: WorkflowStateStore,
        allocator: ResourceAllocator,
        workspace: Arc<dyn Workspace>,
        executor: Arc<dyn PhaseExecutor>,
        project_dir: impl Into<PathBuf>,
    ) -> Self {
        let retry = RetryConfig::default();
        Self {
            store,
            allocator,
            workspace,
            executor,
            tracker: Arc::new(MemoryTracker::new()),
            sink: Arc::new(NullSink),
            detector: LoopDetector::from_config(&retry),
            retry,
            flags: Vec::new(),
            project_dir: project_dir.into(),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn IssueTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TransitionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.detector = LoopDetector::from_config(&retry);
        self.retry = retry;
        self
    }

    /// Flags passed through to every executor invocation.
    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    pub fn store(&self) -> &WorkflowStateStore {
        &self.store
    }

    /// Load the workflow's record, creating a queued one if none exists.
    pub fn load_or_create(
        &self,
        adw_id: &str,
        issue_ref: &str,
        template: WorkflowTemplate,
    ) -> Result<WorkflowState, OrchestratorError> {
        validate_adw_id(adw_id)?;
        match self.store.load(adw_id) {
            Ok(state) => {
                if state.issue_ref != issue_ref {
                    warn!(adw_id, recorded = %state.issue_ref, requested = issue_ref, "issue differs from recorded state, keeping recorded");
                }
                Ok(state)
            }
            Err(StateError::NotFound { .. }) => {
                let state = WorkflowState::new(adw_id, issue_ref, template);
                self.store.save(&state)?;
                info!(adw_id, issue = issue_ref, template = %template, "created workflow");
                Ok(state)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run every pending phase of a workflow in order.
    ///
    /// The loop detector is consulted before anything else; when it trips,
    /// nothing is created, mutated or executed.
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary, OrchestratorError> {
        self.detector
            .inspect(self.tracker.as_ref(), &request.issue_ref)
            .await?;

        let adw_id = request.adw_id.clone().unwrap_or_else(generate_adw_id);
        let mut state = self.load_or_create(&adw_id, &request.issue_ref, request.template)?;

        if state.status == WorkflowStatus::Completed {
            info!(adw_id = %adw_id, "workflow already completed");
            return Ok(RunSummary::from_state(&state));
        }

        state.transition(WorkflowStatus::Running)?;
        if let Some(from) = request.from {
            self.skip_until(&mut state, from).await?;
        }
        self.store.save(&state)?;
        info!(
            adw_id = %adw_id,
            issue = %state.issue_ref,
            template = %state.workflow_template,
            completed = state.completed_phases.len(),
            "starting pipeline"
        );

        while let Some(phase) = state.next_pending_phase() {
            self.run_phase(&adw_id, phase).await?;
            state = self.store.load(&adw_id)?;
        }

        state.transition(WorkflowStatus::Completed)?;
        self.store.save(&state)?;
        let last = state
            .phase_plan()
            .last()
            .copied()
            .unwrap_or(Phase::Plan);
        self.emit(&state.adw_id, last, WorkflowStatus::Completed, TransitionKind::Completed)
            .await;
        info!(adw_id = %adw_id, skipped = state.skipped_phases.len(), "pipeline completed");
        Ok(RunSummary::from_state(&state))
    }

    /// Mark pending phases that precede `from` as skipped.
    async fn skip_until(&self, state: &mut WorkflowState, from: Phase) -> Result<(), OrchestratorError> {
        let plan = state.phase_plan();
        if !plan.contains(&from) {
            return Err(anyhow::anyhow!(
                "Phase {} is not part of the {} template",
                from,
                state.workflow_template
            )
            .into());
        }
        for phase in plan.into_iter().take_while(|p| *p != from) {
            if state.has_completed(phase) || state.skipped_phases.contains(&phase) {
                continue;
            }
            warn!(adw_id = %state.adw_id, %phase, "skipping phase before --from");
            state.skip_phase(phase);
            self.emit(&state.adw_id, phase, state.status, TransitionKind::Skipped)
                .await;
        }
        Ok(())
    }

    /// Run one phase with its retry policy.
    ///
    /// A critical phase that exhausts its attempts marks the workflow failed,
    /// persists that, and only then returns the error.
    pub async fn run_phase(&self, adw_id: &str, phase: Phase) -> Result<PhaseOutcome, OrchestratorError> {
        let mut state = self.store.load(adw_id)?;
        if state.has_completed(phase) {
            return Ok(PhaseOutcome::AlreadyCompleted);
        }

        if self.needs_workspace(&state) {
            state = match self.prepare_workspace(adw_id).await {
                Ok(state) => state,
                Err(e) => return Err(self.record_abort(adw_id, phase, e, false).await),
            };
        }
        if let Err(e) = state.validate_for(phase) {
            return Err(self.record_abort(adw_id, phase, e.into(), true).await);
        }
        state.transition(WorkflowStatus::Running)?;
        state.current_phase = Some(phase);
        self.store.save(&state)?;
        self.emit(adw_id, phase, state.status, TransitionKind::Started)
            .await;

        let max_attempts = self.retry.retries_for(phase) + 1;
        let mut exit_code = -1;
        for attempt in 1..=max_attempts {
            let ctx = self.context(&state, phase, attempt);
            let result_path = self.store.artifact_dir(adw_id, phase).join(RESULT_FILE_NAME);
            let result_before = modified(&result_path);

            exit_code = match self.executor.execute(&ctx).await {
                Ok(outcome) => outcome.exit_code,
                Err(e) => {
                    warn!(adw_id, %phase, attempt, error = %e, "executor did not run");
                    -1
                }
            };

            // Executors may rewrite the record while they run.
            state = self.store.load(adw_id)?;
            if modified(&result_path) != result_before {
                merge_phase_result(&mut state, &result_path);
            }

            if exit_code == 0 {
                state.complete_phase(phase)?;
                self.store.save(&state)?;
                if attempt > 1 {
                    info!(adw_id, %phase, attempt, "phase recovered after retry");
                    self.emit_with(
                        PhaseUpdate::new(adw_id, phase, state.status, TransitionKind::Recovered)
                            .with_metadata(serde_json::json!({ "attempts": attempt })),
                    )
                    .await;
                }
                self.emit(adw_id, phase, state.status, TransitionKind::Completed)
                    .await;
                info!(adw_id, %phase, attempts = attempt, "phase completed");
                return Ok(PhaseOutcome::Completed { attempts: attempt });
            }

            self.store.save(&state)?;
            if attempt < max_attempts {
                warn!(adw_id, %phase, attempt, max_attempts, exit_code, "phase failed, retrying");
                self.record_retry(&state, phase, attempt, max_attempts, exit_code)
                    .await;
            }
        }

        if phase.is_critical() {
            state.failed_phase = Some(phase);
            if state.error.is_none() {
                state.error = Some(format!(
                    "{} failed after {} attempt(s) with exit code {}",
                    phase, max_attempts, exit_code
                ));
            }
            state.transition(WorkflowStatus::Failed)?;
            self.store.save(&state)?;
            self.emit(adw_id, phase, state.status, TransitionKind::Failed)
                .await;
            warn!(adw_id, %phase, attempts = max_attempts, "critical phase failed, aborting workflow");
            return Err(OrchestratorError::PhaseExecution {
                phase: phase.to_string(),
                attempts: max_attempts,
                exit_code,
            });
        }

        warn!(adw_id, %phase, attempts = max_attempts, "non-critical phase failed, continuing");
        state.skip_phase(phase);
        self.store.save(&state)?;
        self.emit(adw_id, phase, state.status, TransitionKind::Skipped)
            .await;
        Ok(PhaseOutcome::Skipped {
            attempts: max_attempts,
        })
    }

    /// Whether the workflow lacks any part of its checkout: live ports, a
    /// branch name, or a worktree directory on disk.
    fn needs_workspace(&self, state: &WorkflowState) -> bool {
        if state.ports().is_none() || !state.is_live() || state.branch_name.is_none() {
            return true;
        }
        match state.worktree_path {
            Some(ref path) => !self.project_dir.join(path).is_dir(),
            None => true,
        }
    }

    /// Persist why a phase could not start and emit a failed transition.
    ///
    /// Terminal aborts fail the workflow. Recoverable ones (pool exhausted,
    /// worktree creation) leave it resumable: a running workflow is paused.
    async fn record_abort(
        &self,
        adw_id: &str,
        phase: Phase,
        err: OrchestratorError,
        terminal: bool,
    ) -> OrchestratorError {
        let mut state = match self.store.load(adw_id) {
            Ok(state) => state,
            Err(e) => {
                warn!(adw_id, %phase, error = %e, "could not record aborted phase");
                return err;
            }
        };

        state.error = Some(err.to_string());
        let next = if terminal {
            state.failed_phase = Some(phase);
            if state.status == WorkflowStatus::Queued {
                let _ = state.transition(WorkflowStatus::Running);
            }
            WorkflowStatus::Failed
        } else if state.status == WorkflowStatus::Running {
            WorkflowStatus::Paused
        } else {
            state.status
        };
        if let Err(e) = state.transition(next) {
            warn!(adw_id, %phase, error = %e, "keeping status of aborted workflow");
        }

        match self.store.save(&state) {
            Ok(()) => {
                self.emit(adw_id, phase, state.status, TransitionKind::Failed)
                    .await
            }
            Err(e) => warn!(adw_id, %phase, error = %e, "could not record aborted phase"),
        }
        warn!(adw_id, %phase, terminal, error = %err, "phase aborted before running");
        err
    }

    /// Claim ports and a worktree path, name the branch and create the worktree.
    async fn prepare_workspace(&self, adw_id: &str) -> Result<WorkflowState, OrchestratorError> {
        let allocator = self.allocator.clone();
        let id = adw_id.to_string();
        let allocation: Allocation = tokio::task::spawn_blocking(move || allocator.allocate(&id))
            .await
            .map_err(|e| OrchestratorError::Other(e.into()))??;

        let mut state = self.store.load(adw_id)?;
        let branch = match state.branch_name {
            Some(ref branch) => branch.clone(),
            None => {
                let branch = branch_name_for(&state.issue_ref, adw_id);
                state.branch_name = Some(branch.clone());
                self.store.save(&state)?;
                branch
            }
        };

        self.workspace
            .create(&allocation.worktree_path, &branch)
            .await
            .map_err(|e| OrchestratorError::Worktree(format!("{e:#}")))?;

        // A previous attempt may have paused on a missing checkout.
        if state.error.take().is_some() {
            self.store.save(&state)?;
        }
        Ok(state)
    }

    async fn record_retry(
        &self,
        state: &WorkflowState,
        phase: Phase,
        attempt: u32,
        max_attempts: u32,
        exit_code: i32,
    ) {
        self.emit_with(
            PhaseUpdate::new(&state.adw_id, phase, state.status, TransitionKind::Retry).with_metadata(
                serde_json::json!({
                    "marker": self.detector.marker(),
                    "attempt": attempt,
                    "max_attempts": max_attempts,
                    "exit_code": exit_code,
                }),
            ),
        )
        .await;

        let body = self
            .detector
            .retry_comment(&state.adw_id, phase.as_str(), attempt, max_attempts);
        if let Err(e) = self.tracker.post_comment(&state.issue_ref, &body).await {
            warn!(adw_id = %state.adw_id, error = %e, "failed to record retry on issue");
        }
    }

    fn context(&self, state: &WorkflowState, phase: Phase, attempt: u32) -> ExecutionContext {
        ExecutionContext {
            adw_id: state.adw_id.clone(),
            issue_ref: state.issue_ref.clone(),
            phase,
            attempt,
            working_dir: self.project_dir.clone(),
            log_file: Some(
                self.store
                    .artifact_dir(&state.adw_id, phase)
                    .join(EXECUTOR_LOG_NAME),
            ),
            worktree_path: state.worktree_path.clone(),
            ports: state.ports(),
            flags: self.flags.clone(),
        }
    }

    async fn emit(&self, adw_id: &str, phase: Phase, status: WorkflowStatus, kind: TransitionKind) {
        self.emit_with(PhaseUpdate::new(adw_id, phase, status, kind))
            .await;
    }

    async fn emit_with(&self, update: PhaseUpdate) {
        self.sink.emit(update).await;
    }

    /// Remove the worktree, delete the branch and release the port pair.
    ///
    /// The branch is kept when asked to, and always when the workflow failed
    /// at ship so its pull request stays open for a human.
    pub async fn cleanup(&self, adw_id: &str, keep_branch: bool) -> Result<CleanupReport, OrchestratorError> {
        let state = self.store.load(adw_id)?;
        let mut report = CleanupReport::default();

        if let Some(ref path) = state.worktree_path {
            self.workspace
                .remove(Path::new(path))
                .await
                .map_err(|e| OrchestratorError::Worktree(format!("{e:#}")))?;
            report.worktree_removed = true;
        }

        let preserve = keep_branch || state.failed_phase == Some(Phase::Ship);
        match state.branch_name {
            Some(ref branch) if !preserve => {
                self.workspace
                    .delete_branch(branch)
                    .await
                    .map_err(|e| OrchestratorError::Worktree(format!("{e:#}")))?;
                report.branch_deleted = true;
            }
            Some(ref branch) => info!(adw_id, branch, "keeping branch"),
            None => {}
        }

        let allocator = self.allocator.clone();
        let id = adw_id.to_string();
        tokio::task::spawn_blocking(move || allocator.release(&id))
            .await
            .map_err(|e| OrchestratorError::Other(e.into()))??;
        info!(adw_id, ?report, "cleaned up workflow resources");
        Ok(report)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Fold a phase's `result.json` summary into the record.
fn merge_phase_result(state: &mut WorkflowState, path: &Path) {
    let parsed = std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).map_err(Into::into));
    let value = match parsed {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable phase result");
            return;
        }
    };

    match value.get("error") {
        Some(serde_json::Value::String(msg)) => state.error = Some(msg.clone()),
        Some(serde_json::Value::Null) => state.error = None,
        _ => {}
    }
    if let Some(cost) = value.get("cost").filter(|c| !c.is_null()) {
        state.cost = Some(cost.clone());
    }
    if let Some(plan) = value.get("plan_file").and_then(|p| p.as_str()) {
        state.plan_artifact_ref = Some(plan.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortsConfig;
    use crate::errors::AllocationError;
    use crate::orchestrator::executor::ExecutionOutcome;
    use crate::orchestrator::sink::RecordingSink;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    /// Exit codes scripted per phase; unscripted attempts succeed. The plan
    /// phase writes a result file naming its plan, as the real one does.
    #[derive(Default)]
    struct ScriptedExecutor {
        exits: Mutex<HashMap<Phase, VecDeque<i32>>>,
        always_fail: Vec<Phase>,
        calls: Mutex<Vec<Phase>>,
        state_dir: PathBuf,
    }

    impl ScriptedExecutor {
        fn new(state_dir: &Path) -> Self {
            Self {
                state_dir: state_dir.to_path_buf(),
                ..Default::default()
            }
        }

        fn script(self, phase: Phase, codes: &[i32]) -> Self {
            self.exits
                .lock()
                .unwrap()
                .insert(phase, codes.iter().copied().collect());
            self
        }

        fn failing(mut self, phase: Phase) -> Self {
            self.always_fail.push(phase);
            self
        }

        fn calls_for(&self, phase: Phase) -> usize {
            self.calls.lock().unwrap().iter().filter(|p| **p == phase).count()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PhaseExecutor for ScriptedExecutor {
        async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, OrchestratorError> {
            self.calls.lock().unwrap().push(ctx.phase);
            if ctx.phase == Phase::Plan {
                let dir = self.state_dir.join(&ctx.adw_id).join("plan");
                std::fs::create_dir_all(&dir).unwrap();
                std::fs::write(
                    dir.join(RESULT_FILE_NAME),
                    r#"{"plan_file": "specs/plan.md", "cost": {"usd": 0.5}}"#,
                )
                .unwrap();
            }
            let exit_code = if self.always_fail.contains(&ctx.phase) {
                1
            } else {
                self.exits
                    .lock()
                    .unwrap()
                    .get_mut(&ctx.phase)
                    .and_then(|q| q.pop_front())
                    .unwrap_or(0)
            };
            Ok(ExecutionOutcome {
                exit_code,
                duration: Duration::ZERO,
            })
        }
    }

    #[derive(Default)]
    struct FakeWorkspace {
        created: Mutex<Vec<(PathBuf, String)>>,
        removed: Mutex<Vec<PathBuf>>,
        deleted_branches: Mutex<Vec<String>>,
        fail_create: AtomicBool,
    }

    #[async_trait]
    impl Workspace for FakeWorkspace {
        async fn create(&self, path: &Path, branch: &str) -> anyhow::Result<()> {
            if self.fail_create.load(Ordering::SeqCst) {
                anyhow::bail!("fatal: '{}' is already checked out", branch);
            }
            std::fs::create_dir_all(path)?;
            self.created
                .lock()
                .unwrap()
                .push((path.to_path_buf(), branch.to_string()));
            Ok(())
        }

        async fn remove(&self, path: &Path) -> anyhow::Result<()> {
            let _ = std::fs::remove_dir_all(path);
            self.removed.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        async fn delete_branch(&self, branch: &str) -> anyhow::Result<()> {
            self.deleted_branches
                .lock()
                .unwrap()
                .push(branch.to_string());
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        store: WorkflowStateStore,
        executor: Arc<ScriptedExecutor>,
        workspace: Arc<FakeWorkspace>,
        sink: Arc<RecordingSink>,
        tracker: Arc<MemoryTracker>,
        orchestrator: PhaseOrchestrator,
    }

    fn harness(build: impl FnOnce(ScriptedExecutor) -> ScriptedExecutor) -> Harness {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("agents");
        let store = WorkflowStateStore::new(&state_dir);
        let allocator = ResourceAllocator::new(
            store.clone(),
            PortsConfig::default(),
            dir.path().join("trees"),
        );
        let executor = Arc::new(build(ScriptedExecutor::new(&state_dir)));
        let workspace = Arc::new(FakeWorkspace::default());
        let sink = Arc::new(RecordingSink::default());
        let tracker = Arc::new(MemoryTracker::new());
        let orchestrator = PhaseOrchestrator::new(
            store.clone(),
            allocator,
            workspace.clone(),
            executor.clone(),
            dir.path(),
        )
        .with_tracker(tracker.clone())
        .with_sink(sink.clone());
        Harness {
            _dir: dir,
            store,
            executor,
            workspace,
            sink,
            tracker,
            orchestrator,
        }
    }

    fn request(adw_id: &str, template: WorkflowTemplate) -> RunRequest {
        RunRequest {
            issue_ref: "42".to_string(),
            adw_id: Some(adw_id.to_string()),
            template,
            from: None,
        }
    }

    #[tokio::test]
    async fn test_full_sdlc_run_completes() {
        let h = harness(|e| e);
        let summary = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::Sdlc))
            .await
            .unwrap();
        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert_eq!(summary.completed_phases, crate::phase::CANONICAL_PHASES.to_vec());

        let state = h.store.load("w1").unwrap();
        assert_eq!(state.backend_port, Some(9100));
        assert_eq!(state.branch_name.as_deref(), Some("adw-w1-issue-42"));
        assert_eq!(state.plan_artifact_ref.as_deref(), Some("specs/plan.md"));
        assert_eq!(state.cost, Some(serde_json::json!({"usd": 0.5})));
        assert!(state.started_at.is_some());
        assert_eq!(h.workspace.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_build_recovers_on_third_attempt() {
        let h = harness(|e| e.script(Phase::Build, &[1, 1, 0]));
        let summary = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::PlanBuild))
            .await
            .unwrap();

        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert_eq!(
            summary.completed_phases,
            vec![Phase::Plan, Phase::Validate, Phase::Build]
        );
        assert_eq!(h.executor.calls_for(Phase::Build), 3);

        let events = h.sink.events();
        let count = |kind| {
            events
                .iter()
                .filter(|(p, k)| *p == Phase::Build && *k == kind)
                .count()
        };
        assert_eq!(count(TransitionKind::Retry), 2);
        assert_eq!(count(TransitionKind::Recovered), 1);
        assert_eq!(count(TransitionKind::Completed), 1);

        let comments = h.tracker.comments_for("42");
        assert_eq!(comments.len(), 2);
        assert!(comments.iter().all(|c| c.contains("[adw-retry]")));
    }

    #[tokio::test]
    async fn test_critical_phase_exhausts_retries_and_fails_workflow() {
        let h = harness(|e| e.failing(Phase::Build));
        let err = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::PlanBuild))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::PhaseExecution {
                phase, attempts, ..
            } => {
                assert_eq!(phase, "build");
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected PhaseExecution, got {other:?}"),
        }
        assert_eq!(h.executor.calls_for(Phase::Build), 3);

        let state = h.store.load("w1").unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.failed_phase, Some(Phase::Build));
        assert!(state.error.is_some());
        assert!(!state.has_completed(Phase::Build));
        assert_eq!(
            h.sink.events().last(),
            Some(&(Phase::Build, TransitionKind::Failed))
        );
    }

    #[tokio::test]
    async fn test_failed_workflow_cannot_be_rerun() {
        let h = harness(|e| e.failing(Phase::Build));
        let _ = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::PlanBuild))
            .await;
        let err = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::PlanBuild))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State(StateError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_critical_phase_is_skipped() {
        let h = harness(|e| e.failing(Phase::Document));
        let summary = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::Sdlc))
            .await
            .unwrap();

        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert_eq!(summary.skipped_phases, vec![Phase::Document]);
        assert!(!summary.completed_phases.contains(&Phase::Document));
        assert!(summary.completed_phases.contains(&Phase::Verify));
        assert_eq!(h.executor.calls_for(Phase::Document), 2);
        assert!(
            h.sink
                .events()
                .contains(&(Phase::Document, TransitionKind::Skipped))
        );
    }

    #[tokio::test]
    async fn test_loop_detector_blocks_run_before_any_phase() {
        let h = harness(|e| e);
        for i in 0..7 {
            h.tracker.post_comment("42", &format!("note {i}")).await.unwrap();
        }
        for i in 0..13 {
            h.tracker
                .post_comment("42", &format!("[adw-retry] attempt {i}"))
                .await
                .unwrap();
        }

        let err = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::Sdlc))
            .await
            .unwrap_err();
        assert!(err.is_loop_detected());
        assert_eq!(h.executor.total_calls(), 0);
        assert!(!h.store.exists("w1"));
        assert!(h.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_ship_refuses_incomplete_state() {
        let h = harness(|e| e);
        let mut state = WorkflowState::new("w1", "42", WorkflowTemplate::Sdlc);
        state.status = WorkflowStatus::Running;
        h.store.save(&state).unwrap();

        let err = h
            .orchestrator
            .run_phase("w1", Phase::Ship)
            .await
            .unwrap_err();
        match err {
            OrchestratorError::State(StateError::Validation { phase, missing }) => {
                assert_eq!(phase, "ship");
                assert_eq!(missing, vec!["plan_file"]);
            }
            other => panic!("Expected Validation, got {other:?}"),
        }
        assert_eq!(h.executor.total_calls(), 0);

        let state = h.store.load("w1").unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.failed_phase, Some(Phase::Ship));
        assert!(state.error.as_deref().unwrap().contains("plan_file"));
        assert_eq!(
            h.sink.events().last(),
            Some(&(Phase::Ship, TransitionKind::Failed))
        );
    }

    #[tokio::test]
    async fn test_preallocated_workflow_still_gets_worktree() {
        let h = harness(|e| e);
        h.store
            .save(&WorkflowState::new("w1", "42", WorkflowTemplate::Sdlc))
            .unwrap();
        let allocator = ResourceAllocator::new(
            h.store.clone(),
            PortsConfig::default(),
            h._dir.path().join("trees"),
        );
        allocator.allocate("w1").unwrap();

        let summary = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::Sdlc))
            .await
            .unwrap();
        assert_eq!(summary.status, WorkflowStatus::Completed);

        let created = h.workspace.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert!(created[0].0.ends_with("trees/w1"));
        assert_eq!(created[0].1, "adw-w1-issue-42");
        let state = h.store.load("w1").unwrap();
        assert_eq!(state.branch_name.as_deref(), Some("adw-w1-issue-42"));
        assert_eq!(state.backend_port, Some(9100));
    }

    #[tokio::test]
    async fn test_exhausted_pool_pauses_with_error() {
        let h = harness(|e| e);
        for i in 0..15u16 {
            let mut state = WorkflowState::new(&format!("busy{i}"), "1", WorkflowTemplate::Sdlc);
            state.backend_port = Some(9100 + i);
            state.frontend_port = Some(9200 + i);
            state.worktree_path = Some(format!("trees/busy{i}"));
            h.store.save(&state).unwrap();
        }

        let err = h
            .orchestrator
            .run(request("w9", WorkflowTemplate::PlanBuild))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Allocation(AllocationError::ResourceExhausted { pool_size: 15 })
        ));
        assert_eq!(h.executor.total_calls(), 0);

        let state = h.store.load("w9").unwrap();
        assert_eq!(state.status, WorkflowStatus::Paused);
        assert!(state.error.as_deref().unwrap().contains("pool of 15"));
        assert_eq!(state.failed_phase, None);
        assert_eq!(
            h.sink.events().last(),
            Some(&(Phase::Plan, TransitionKind::Failed))
        );
    }

    #[tokio::test]
    async fn test_worktree_failure_is_recorded_and_resumable() {
        let h = harness(|e| e);
        h.workspace.fail_create.store(true, Ordering::SeqCst);
        let err = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::PlanBuild))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Worktree(_)));
        assert_eq!(h.executor.total_calls(), 0);

        let state = h.store.load("w1").unwrap();
        assert_eq!(state.status, WorkflowStatus::Paused);
        assert!(state.error.as_deref().unwrap().contains("already checked out"));
        assert!(state.ports().is_some());
        assert_eq!(
            h.sink.events().last(),
            Some(&(Phase::Plan, TransitionKind::Failed))
        );

        h.workspace.fail_create.store(false, Ordering::SeqCst);
        let summary = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::PlanBuild))
            .await
            .unwrap();
        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert_eq!(h.workspace.created.lock().unwrap().len(), 1);
        assert!(h.store.load("w1").unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_resume_skips_completed_phases() {
        let h = harness(|e| e);
        let mut state = WorkflowState::new("w1", "42", WorkflowTemplate::PlanBuild);
        state.status = WorkflowStatus::Paused;
        state.complete_phase(Phase::Plan).unwrap();
        state.complete_phase(Phase::Validate).unwrap();
        h.store.save(&state).unwrap();

        let summary = h
            .orchestrator
            .run(request("w1", WorkflowTemplate::PlanBuild))
            .await
            .unwrap();
        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert_eq!(h.executor.calls_for(Phase::Plan), 0);
        assert_eq!(h.executor.calls_for(Phase::Validate), 0);
        assert_eq!(h.executor.calls_for(Phase::Build), 1);
    }

    #[tokio::test]
    async fn test_from_skips_earlier_phases() {
        let h = harness(|e| e);
        let mut req = request("w1", WorkflowTemplate::PlanBuild);
        req.from = Some(Phase::Build);
        let summary = h.orchestrator.run(req).await.unwrap();

        assert_eq!(summary.completed_phases, vec![Phase::Build]);
        assert_eq!(summary.skipped_phases, vec![Phase::Plan, Phase::Validate]);
        assert_eq!(h.executor.total_calls(), 1);
        // the first phase that runs still gets resources
        assert!(h.store.load("w1").unwrap().ports().is_some());
    }

    #[tokio::test]
    async fn test_from_outside_template_is_rejected() {
        let h = harness(|e| e);
        let mut req = request("w1", WorkflowTemplate::PlanBuild);
        req.from = Some(Phase::Ship);
        assert!(h.orchestrator.run(req).await.is_err());
        assert_eq!(h.executor.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_result_file_is_not_remerged() {
        let h = harness(|e| e);
        let build_dir = h.store.artifact_dir("w1", Phase::Build);
        std::fs::create_dir_all(&build_dir).unwrap();
        std::fs::write(build_dir.join(RESULT_FILE_NAME), r#"{"error": "old failure"}"#).unwrap();

        h.orchestrator
            .run(request("w1", WorkflowTemplate::PlanBuild))
            .await
            .unwrap();
        let state = h.store.load("w1").unwrap();
        assert_eq!(state.plan_artifact_ref.as_deref(), Some("specs/plan.md"));
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_releases_and_deletes_branch() {
        let h = harness(|e| e);
        h.orchestrator
            .run(request("w1", WorkflowTemplate::PlanBuild))
            .await
            .unwrap();

        let report = h.orchestrator.cleanup("w1", false).await.unwrap();
        assert!(report.worktree_removed);
        assert!(report.branch_deleted);
        assert_eq!(
            h.workspace.deleted_branches.lock().unwrap().as_slice(),
            ["adw-w1-issue-42"]
        );
        let state = h.store.load("w1").unwrap();
        assert!(!state.is_live());
        assert_eq!(state.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_branch_after_ship_failure() {
        let h = harness(|e| e);
        let mut state = WorkflowState::new("w1", "42", WorkflowTemplate::Sdlc);
        state.branch_name = Some("adw-w1-issue-42".into());
        state.worktree_path = Some("/nonexistent/trees/w1".into());
        state.failed_phase = Some(Phase::Ship);
        state.status = WorkflowStatus::Failed;
        h.store.save(&state).unwrap();

        let report = h.orchestrator.cleanup("w1", false).await.unwrap();
        assert!(report.worktree_removed);
        assert!(!report.branch_deleted);
        assert!(h.workspace.deleted_branches.lock().unwrap().is_empty());
    }

    #[test]
    fn test_merge_phase_result() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("result.json");
        std::fs::write(&path, r#"{"error": "tsc: 3 errors", "cost": 1.25}"#).unwrap();
        let mut state = WorkflowState::new("w1", "1", WorkflowTemplate::Sdlc);
        merge_phase_result(&mut state, &path);
        assert_eq!(state.error.as_deref(), Some("tsc: 3 errors"));
        assert_eq!(state.cost, Some(serde_json::json!(1.25)));

        std::fs::write(&path, "not json").unwrap();
        merge_phase_result(&mut state, &path);
        assert_eq!(state.error.as_deref(), Some("tsc: 3 errors"));
    }
}
