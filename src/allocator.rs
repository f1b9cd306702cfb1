//! Worktree and port-pair allocation.
//!
//! Every workflow gets a dedicated worktree path and a `(backend, frontend)`
//! port pair from a fixed pool. Allocation scans all live state records and
//! claims the lowest free slot. The scan and the write happen under an
//! exclusive lock on `<state_dir>/.allocation.lock`, so two controller
//! processes allocating at once cannot claim the same slot.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PortsConfig;
use crate::errors::{AllocationError, StateError};
use crate::state::{WorkflowState, WorkflowStateStore, validate_adw_id};

const LOCK_FILE_NAME: &str = ".allocation.lock";

/// The isolated resources a workflow runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub worktree_path: PathBuf,
    pub backend_port: u16,
    pub frontend_port: u16,
}

/// What a conflicting workflow shares with the one being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Ports,
    Worktree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingWorkflow {
    pub adw_id: String,
    pub kind: ConflictKind,
    pub backend_port: Option<u16>,
    pub frontend_port: Option<u16>,
    pub worktree_path: Option<String>,
}

/// Lowest pool slot whose backend and frontend ports are both unclaimed.
pub fn find_free_pair(claimed: &HashSet<u16>, ports: &PortsConfig) -> Option<(u16, u16)> {
    (0..ports.pool_size)
        .filter_map(|i| {
            let backend = ports.backend_start.checked_add(i)?;
            let frontend = ports.frontend_start.checked_add(i)?;
            Some((backend, frontend))
        })
        .find(|(b, f)| !claimed.contains(b) && !claimed.contains(f))
}

/// Conflicts between `target` and `others`, skipping released records and itself.
pub fn find_conflicts(target: &WorkflowState, others: &[WorkflowState]) -> Vec<ConflictingWorkflow> {
    let mine: HashSet<u16> = [target.backend_port, target.frontend_port]
        .into_iter()
        .flatten()
        .collect();

    others
        .iter()
        .filter(|other| other.adw_id != target.adw_id && other.is_live())
        .filter_map(|other| {
            let shares_port = [other.backend_port, other.frontend_port]
                .into_iter()
                .flatten()
                .any(|p| mine.contains(&p));
            let shares_tree = target.worktree_path.is_some()
                && target.worktree_path == other.worktree_path;
            let kind = if shares_port {
                ConflictKind::Ports
            } else if shares_tree {
                ConflictKind::Worktree
            } else {
                return None;
            };
            Some(ConflictingWorkflow {
                adw_id: other.adw_id.clone(),
                kind,
                backend_port: other.backend_port,
                frontend_port: other.frontend_port,
                worktree_path: other.worktree_path.clone(),
            })
        })
        .collect()
}

/// Assigns worktrees and port pairs to workflows.
#[derive(Debug, Clone)]
pub struct ResourceAllocator {
    store: WorkflowStateStore,
    ports: PortsConfig,
    trees_dir: PathBuf,
    guard: Arc<Mutex<()>>,
}

impl ResourceAllocator {
    pub fn new(store: WorkflowStateStore, ports: PortsConfig, trees_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            ports,
            trees_dir: trees_dir.into(),
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Worktree path for a workflow, derived only from its id.
    pub fn worktree_path_for(&self, adw_id: &str) -> PathBuf {
        self.trees_dir.join(adw_id)
    }

    pub fn trees_dir(&self) -> &Path {
        &self.trees_dir
    }

    /// Claim a worktree path and the lowest free port pair for `adw_id` and
    /// persist them into its state record. A workflow that already holds a
    /// live pair gets the same pair back.
    pub fn allocate(&self, adw_id: &str) -> Result<Allocation, AllocationError> {
        validate_adw_id(adw_id)?;
        let _in_process = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock_file = self.acquire_lock()?;

        let result = self.allocate_locked(adw_id);

        if let Err(e) = FileExt::unlock(&lock_file) {
            warn!(error = %e, "failed to release allocation lock");
        }
        result
    }

    fn allocate_locked(&self, adw_id: &str) -> Result<Allocation, AllocationError> {
        let mut state = self.store.load(adw_id)?;
        let worktree_path = self.worktree_path_for(adw_id);

        if state.is_live() {
            if let Some((backend_port, frontend_port)) = state.ports() {
                return Ok(Allocation {
                    worktree_path: state
                        .worktree_path
                        .as_ref()
                        .map(PathBuf::from)
                        .unwrap_or(worktree_path),
                    backend_port,
                    frontend_port,
                });
            }
        }

        let claimed: HashSet<u16> = self
            .store
            .list_all()?
            .iter()
            .filter(|s| s.adw_id != adw_id && s.is_live())
            .flat_map(|s| [s.backend_port, s.frontend_port])
            .flatten()
            .collect();

        let (backend_port, frontend_port) =
            find_free_pair(&claimed, &self.ports).ok_or(AllocationError::ResourceExhausted {
                pool_size: self.ports.pool_size,
            })?;

        state.backend_port = Some(backend_port);
        state.frontend_port = Some(frontend_port);
        state.worktree_path = Some(worktree_path.to_string_lossy().into_owned());
        state.resources_released_at = None;
        self.store.save(&state)?;

        info!(adw_id, backend_port, frontend_port, worktree = %worktree_path.display(), "allocated resources");
        Ok(Allocation {
            worktree_path,
            backend_port,
            frontend_port,
        })
    }

    /// Mark a workflow's resources as released. The record itself stays.
    pub fn release(&self, adw_id: &str) -> Result<(), AllocationError> {
        let _in_process = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock_file = self.acquire_lock()?;
        let result = self
            .store
            .update(adw_id, |state| {
                state.resources_released_at = Some(chrono::Utc::now());
                Ok(())
            })
            .map(|_| ())
            .map_err(AllocationError::from);
        if let Err(e) = FileExt::unlock(&lock_file) {
            warn!(error = %e, "failed to release allocation lock");
        }
        if result.is_ok() {
            info!(adw_id, "released resources");
        }
        result
    }

    /// Other live workflows whose ports or worktree overlap this one's.
    /// Diagnostic only; nothing is blocked on the result.
    pub fn detect_conflicts(&self, adw_id: &str) -> Result<Vec<ConflictingWorkflow>, StateError> {
        let target = self.store.load(adw_id)?;
        let all = self.store.list_all()?;
        Ok(find_conflicts(&target, &all))
    }

    fn acquire_lock(&self) -> Result<std::fs::File, AllocationError> {
        let path = self.store.root().join(LOCK_FILE_NAME);
        let lock_err = |source| AllocationError::Lock {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(self.store.root()).map_err(lock_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(lock_err)?;
        file.lock_exclusive().map_err(lock_err)?;
        Ok(file)
    }
}
