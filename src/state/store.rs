use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use regex::Regex;
use tracing::{debug, warn};

use super::record::WorkflowState;
use crate::errors::StateError;
use crate::phase::Phase;

/// File name of the state record inside a workflow's directory.
pub const STATE_FILE_NAME: &str = "adw_state.json";

static ADW_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

/// Reject ids that could escape the state directory.
pub fn validate_adw_id(adw_id: &str) -> Result<(), StateError> {
    if ADW_ID_REGEX.is_match(adw_id) {
        Ok(())
    } else {
        Err(StateError::InvalidId(adw_id.to_string()))
    }
}

/// Generate a fresh 8-character workflow id.
pub fn generate_adw_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Durable keyed storage of one [`WorkflowState`] per workflow.
///
/// Layout: `<root>/<adw_id>/adw_state.json`, with phase artifacts in
/// sibling directories `<root>/<adw_id>/<phase>/`. Saves overwrite the whole
/// record; callers read-modify-write and keep a single writer per id.
#[derive(Debug, Clone)]
pub struct WorkflowStateStore {
    root: PathBuf,
}

impl WorkflowStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workflow_dir(&self, adw_id: &str) -> PathBuf {
        self.root.join(adw_id)
    }

    pub fn state_path(&self, adw_id: &str) -> PathBuf {
        self.workflow_dir(adw_id).join(STATE_FILE_NAME)
    }

    pub fn artifact_dir(&self, adw_id: &str, phase: Phase) -> PathBuf {
        self.workflow_dir(adw_id).join(phase.as_str())
    }

    pub fn exists(&self, adw_id: &str) -> bool {
        self.state_path(adw_id).is_file()
    }

    pub fn load(&self, adw_id: &str) -> Result<WorkflowState, StateError> {
        validate_adw_id(adw_id)?;
        let path = self.state_path(adw_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound {
                    adw_id: adw_id.to_string(),
                });
            }
            Err(source) => return Err(StateError::Io { path, source }),
        };
        serde_json::from_str(&content).map_err(|source| StateError::Corrupt { path, source })
    }

    /// Overwrite the record. Writes to a temp file and renames so readers
    /// never observe a half-written document.
    pub fn save(&self, state: &WorkflowState) -> Result<(), StateError> {
        validate_adw_id(&state.adw_id)?;
        let dir = self.workflow_dir(&state.adw_id);
        fs::create_dir_all(&dir).map_err(|source| StateError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = self.state_path(&state.adw_id);
        let tmp = dir.join(format!(".{}.tmp", STATE_FILE_NAME));
        let content = serde_json::to_string_pretty(state).map_err(StateError::Serialize)?;
        fs::write(&tmp, content).map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StateError::Io { path, source })?;
        debug!(adw_id = %state.adw_id, status = %state.status, "saved workflow state");
        Ok(())
    }

    /// Read-modify-write helper. The closure's error aborts the save.
    pub fn update<F>(&self, adw_id: &str, f: F) -> Result<WorkflowState, StateError>
    where
        F: FnOnce(&mut WorkflowState) -> Result<(), StateError>,
    {
        let mut state = self.load(adw_id)?;
        f(&mut state)?;
        self.save(&state)?;
        Ok(state)
    }

    /// Every readable state record. Corrupt or unreadable records are logged
    /// and skipped; the scan itself only fails if the root cannot be listed.
    pub fn list_all(&self) -> Result<Vec<WorkflowState>, StateError> {
        let states: Vec<WorkflowState> = self
            .scan()?
            .into_iter()
            .filter_map(|(adw_id, loaded)| match loaded {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(adw_id = %adw_id, error = %e, "skipping unreadable state record");
                    None
                }
            })
            .collect();
        debug!(count = states.len(), root = %self.root.display(), "scanned state records");
        Ok(states)
    }

    /// Load every workflow directory that holds a state file, keeping each
    /// record's individual outcome. Sorted by id.
    pub fn scan(&self) -> Result<Vec<(String, Result<WorkflowState, StateError>)>, StateError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut results: Vec<_> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|adw_id| validate_adw_id(adw_id).is_ok() && self.exists(adw_id))
            .map(|adw_id| {
                let loaded = self.load(&adw_id);
                (adw_id, loaded)
            })
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    /// Last write time of the state record.
    pub fn modified_at(&self, adw_id: &str) -> Option<SystemTime> {
        fs::metadata(self.state_path(adw_id))
            .and_then(|m| m.modified())
            .ok()
    }

    /// The phase whose artifact directory was touched most recently.
    pub fn latest_artifact_phase(&self, adw_id: &str) -> Option<Phase> {
        let entries = fs::read_dir(self.workflow_dir(adw_id)).ok()?;
        entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let phase: Phase = e.file_name().to_str()?.parse().ok()?;
                let modified = e.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, phase))
            })
            .max()
            .map(|(_, phase)| phase)
    }
}
