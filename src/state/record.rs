use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::StateError;
use crate::phase::{Phase, WorkflowTemplate, is_ordered_prefix};

/// Persisted lifecycle status of a workflow.
///
/// Moves `queued → running → {completed | failed}`; `paused` is reachable
/// from `running` and returns to `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Queued => "queued",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    /// Whether `self → next` is a legal move. Staying put is always legal.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Queued, Running)
                    | (Running, Paused)
                    | (Paused, Running)
                    | (Running, Completed)
                    | (Running, Failed)
            )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(WorkflowStatus::Queued),
            "running" | "in_progress" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            _ => anyhow::bail!(
                "Invalid status '{}'. Valid values: queued, running, paused, completed, failed",
                s
            ),
        }
    }
}

/// One workflow's durable state, stored as `<state_dir>/<adw_id>/adw_state.json`.
///
/// Unknown keys written by phase executors are carried through `extra` so a
/// read-modify-write by the orchestrator never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub adw_id: String,
    /// External work-item reference (issue number).
    #[serde(rename = "issue_number", deserialize_with = "string_or_number")]
    pub issue_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Phase>,
    #[serde(default)]
    pub completed_phases: Vec<Phase>,
    /// Non-critical phases that exhausted their retries and were passed over.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_phases: Vec<Phase>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(rename = "start_time", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "plan_file", default, skip_serializing_if = "Option::is_none")]
    pub plan_artifact_ref: Option<String>,
    #[serde(default)]
    pub workflow_template: WorkflowTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
    /// Free-form cost summary, only read by the status aggregator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<serde_json::Value>,
    /// Free-form error summary, only read by the status aggregator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_released_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl WorkflowState {
    pub fn new(adw_id: &str, issue_ref: &str, template: WorkflowTemplate) -> Self {
        Self {
            adw_id: adw_id.to_string(),
            issue_ref: issue_ref.to_string(),
            branch_name: None,
            worktree_path: None,
            backend_port: None,
            frontend_port: None,
            current_phase: None,
            completed_phases: Vec::new(),
            skipped_phases: Vec::new(),
            status: WorkflowStatus::Queued,
            started_at: None,
            plan_artifact_ref: None,
            workflow_template: template,
            github_url: None,
            cost: None,
            error: None,
            failed_phase: None,
            resources_released_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// The phases this workflow runs, in order.
    pub fn phase_plan(&self) -> Vec<Phase> {
        self.workflow_template.phases()
    }

    /// The claimed `(backend_port, frontend_port)` pair, if both are set.
    pub fn ports(&self) -> Option<(u16, u16)> {
        Some((self.backend_port?, self.frontend_port?))
    }

    /// A state still holds its worktree and ports until cleanup releases them.
    pub fn is_live(&self) -> bool {
        self.resources_released_at.is_none()
    }

    pub fn has_completed(&self, phase: Phase) -> bool {
        self.completed_phases.contains(&phase)
    }

    /// The next phase of the plan that has neither completed nor been skipped.
    pub fn next_pending_phase(&self) -> Option<Phase> {
        self.phase_plan()
            .into_iter()
            .find(|p| !self.completed_phases.contains(p) && !self.skipped_phases.contains(p))
    }

    /// The plan with skipped phases removed; `completed_phases` is a prefix of it.
    fn effective_plan(&self) -> Vec<Phase> {
        self.phase_plan()
            .into_iter()
            .filter(|p| !self.skipped_phases.contains(p))
            .collect()
    }

    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == WorkflowStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Append `phase` to `completed_phases`, keeping the list a gap-free
    /// prefix of the plan. Completing an already-completed phase is a no-op.
    pub fn complete_phase(&mut self, phase: Phase) -> Result<(), StateError> {
        if self.has_completed(phase) {
            return Ok(());
        }
        let mut candidate = self.completed_phases.clone();
        candidate.push(phase);
        if !is_ordered_prefix(&candidate, &self.effective_plan()) {
            return Err(StateError::InvalidTransition {
                from: self
                    .completed_phases
                    .last()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "start".to_string()),
                to: phase.to_string(),
            });
        }
        self.completed_phases = candidate;
        Ok(())
    }

    /// Record that a non-critical `phase` was passed over after exhausting
    /// its retries. It never enters `completed_phases`.
    pub fn skip_phase(&mut self, phase: Phase) {
        if !self.skipped_phases.contains(&phase) && !self.has_completed(phase) {
            self.skipped_phases.push(phase);
        }
    }

    /// Fields a phase needs before its executor may run.
    pub fn validate_for(&self, phase: Phase) -> Result<(), StateError> {
        let mut missing = Vec::new();
        if phase == Phase::Ship {
            if self.branch_name.is_none() {
                missing.push("branch_name");
            }
            if self.worktree_path.is_none() {
                missing.push("worktree_path");
            }
            if self.backend_port.is_none() {
                missing.push("backend_port");
            }
            if self.frontend_port.is_none() {
                missing.push("frontend_port");
            }
            if self.plan_artifact_ref.is_none() {
                missing.push("plan_file");
            }
        } else if phase != Phase::Plan && self.worktree_path.is_none() {
            missing.push("worktree_path");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StateError::Validation {
                phase: phase.to_string(),
                missing: missing.into_iter().map(String::from).collect(),
            })
        }
    }
}

/// Older records store the issue number as a JSON number.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}
