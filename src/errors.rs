//! Typed error hierarchy for the ADW orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `StateError` — state record persistence and validation
//! - `AllocationError` — port/worktree allocation
//! - `OrchestratorError` — phase sequencing, retries and the loop detector

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the workflow state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("No state found for workflow {adw_id}")]
    NotFound { adw_id: String },

    #[error("Corrupt state record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid workflow id '{0}': expected letters, digits, '-' or '_'")]
    InvalidId(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Phase {phase} requires state fields that are missing: {}", missing.join(", "))]
    Validation { phase: String, missing: Vec<String> },

    #[error("Failed to access state file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Errors from the resource allocator.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("No free port pair left in a pool of {pool_size}")]
    ResourceExhausted { pool_size: u16 },

    #[error("Failed to acquire allocation lock at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors from the phase orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Phase {phase} failed after {attempts} attempt(s) (last exit code {exit_code})")]
    PhaseExecution {
        phase: String,
        attempts: u32,
        exit_code: i32,
    },

    #[error(
        "Loop detected: {count} retry markers in the last {window} messages (threshold {threshold})"
    )]
    LoopDetected {
        count: usize,
        threshold: usize,
        window: usize,
    },

    #[error("Failed to spawn executor for phase {phase}: {source}")]
    Spawn {
        phase: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worktree error: {0}")]
    Worktree(String),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// True when the error is the loop detector tripping rather than a phase failing.
    pub fn is_loop_detected(&self) -> bool {
        matches!(self, OrchestratorError::LoopDetected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_not_found_carries_id() {
        let err = StateError::NotFound {
            adw_id: "a1b2c3d4".to_string(),
        };
        assert!(err.to_string().contains("a1b2c3d4"));
    }

    #[test]
    fn validation_error_lists_missing_fields() {
        let err = StateError::Validation {
            phase: "ship".to_string(),
            missing: vec!["branch_name".to_string(), "backend_port".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("ship"));
        assert!(msg.contains("branch_name, backend_port"));
    }

    #[test]
    fn allocation_error_converts_into_orchestrator_error() {
        let inner = AllocationError::ResourceExhausted { pool_size: 15 };
        let err: OrchestratorError = inner.into();
        match &err {
            OrchestratorError::Allocation(AllocationError::ResourceExhausted { pool_size }) => {
                assert_eq!(*pool_size, 15)
            }
            _ => panic!("Expected Allocation(ResourceExhausted)"),
        }
    }

    #[test]
    fn loop_detected_is_matchable() {
        let err = OrchestratorError::LoopDetected {
            count: 13,
            threshold: 12,
            window: 20,
        };
        assert!(err.is_loop_detected());
        assert!(err.to_string().contains("13 retry markers"));

        let other = OrchestratorError::Worktree("gone".into());
        assert!(!other.is_loop_detected());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StateError::InvalidId("..".into()));
        assert_std_error(&AllocationError::ResourceExhausted { pool_size: 2 });
        assert_std_error(&OrchestratorError::Worktree("x".into()));
    }
}
