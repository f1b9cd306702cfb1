//! Phase definitions for the ADW pipeline.
//!
//! This module provides:
//! - `Phase`, the closed set of pipeline stages in canonical order
//! - `WorkflowTemplate`, which selects the subsequence of phases a workflow runs
//! - the prefix check that keeps `completed_phases` gap-free

use serde::{Deserialize, Serialize};

/// One named stage of the pipeline. Variant order is the canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Plan,
    Validate,
    Build,
    Lint,
    Test,
    Review,
    Document,
    Ship,
    Cleanup,
    Verify,
}

/// Every phase in canonical order.
pub const CANONICAL_PHASES: [Phase; 10] = [
    Phase::Plan,
    Phase::Validate,
    Phase::Build,
    Phase::Lint,
    Phase::Test,
    Phase::Review,
    Phase::Document,
    Phase::Ship,
    Phase::Cleanup,
    Phase::Verify,
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Validate => "validate",
            Phase::Build => "build",
            Phase::Lint => "lint",
            Phase::Test => "test",
            Phase::Review => "review",
            Phase::Document => "document",
            Phase::Ship => "ship",
            Phase::Cleanup => "cleanup",
            Phase::Verify => "verify",
        }
    }

    /// Position in the canonical order (0-based).
    pub fn index(&self) -> usize {
        CANONICAL_PHASES
            .iter()
            .position(|p| p == self)
            .unwrap_or(CANONICAL_PHASES.len())
    }

    /// Critical phases abort the workflow when their retries run out;
    /// non-critical ones log a warning and the pipeline moves on.
    pub fn is_critical(&self) -> bool {
        !matches!(self, Phase::Document | Phase::Verify)
    }

    /// The phase after this one in canonical order.
    pub fn next(&self) -> Option<Phase> {
        CANONICAL_PHASES.get(self.index() + 1).copied()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CANONICAL_PHASES
            .iter()
            .find(|p| p.as_str() == s.trim().to_lowercase())
            .copied()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid phase '{}'. Valid values: {}",
                    s,
                    CANONICAL_PHASES.map(|p| p.as_str()).join(", ")
                )
            })
    }
}

/// Selects which phases a workflow runs. Every template is a subsequence of
/// [`CANONICAL_PHASES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTemplate {
    #[default]
    Sdlc,
    PlanBuild,
    PlanBuildTest,
    PlanBuildReview,
    PlanBuildTestReview,
    /// Zero-touch execution: the full pipeline, shipping without a human gate.
    Zte,
}

impl WorkflowTemplate {
    pub fn phases(&self) -> Vec<Phase> {
        use Phase::*;
        match self {
            WorkflowTemplate::Sdlc | WorkflowTemplate::Zte => CANONICAL_PHASES.to_vec(),
            WorkflowTemplate::PlanBuild => vec![Plan, Validate, Build],
            WorkflowTemplate::PlanBuildTest => vec![Plan, Validate, Build, Lint, Test],
            WorkflowTemplate::PlanBuildReview => vec![Plan, Validate, Build, Lint, Review],
            WorkflowTemplate::PlanBuildTestReview => {
                vec![Plan, Validate, Build, Lint, Test, Review]
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowTemplate::Sdlc => "sdlc",
            WorkflowTemplate::PlanBuild => "plan_build",
            WorkflowTemplate::PlanBuildTest => "plan_build_test",
            WorkflowTemplate::PlanBuildReview => "plan_build_review",
            WorkflowTemplate::PlanBuildTestReview => "plan_build_test_review",
            WorkflowTemplate::Zte => "zte",
        }
    }
}

impl std::fmt::Display for WorkflowTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowTemplate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "sdlc" => Ok(WorkflowTemplate::Sdlc),
            "plan_build" => Ok(WorkflowTemplate::PlanBuild),
            "plan_build_test" => Ok(WorkflowTemplate::PlanBuildTest),
            "plan_build_review" => Ok(WorkflowTemplate::PlanBuildReview),
            "plan_build_test_review" => Ok(WorkflowTemplate::PlanBuildTestReview),
            "zte" => Ok(WorkflowTemplate::Zte),
            _ => anyhow::bail!(
                "Invalid workflow template '{}'. Valid values: sdlc, plan_build, plan_build_test, plan_build_review, plan_build_test_review, zte",
                s
            ),
        }
    }
}

/// Check that `completed` is a gap-free, in-order prefix of `plan`.
pub fn is_ordered_prefix(completed: &[Phase], plan: &[Phase]) -> bool {
    completed.len() <= plan.len() && completed.iter().zip(plan).all(|(c, p)| c == p)
}
