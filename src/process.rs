//! Registry of running phase-executor processes.
//!
//! The executor records each child's pid when it spawns and removes it when
//! the child exits. Liveness is answered by signalling the recorded pids, so
//! monitors never have to parse a process table or guess from command lines.
//! Records live under `<state_dir>/<adw_id>/pids/<pid>`, which lets a separate
//! monitoring process see executors spawned by controller processes.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::phase::Phase;

const PIDS_DIR: &str = "pids";

pub trait ProcessRegistry: Send + Sync {
    fn register(&self, adw_id: &str, pid: u32, phase: Phase) -> Result<()>;

    fn unregister(&self, adw_id: &str, pid: u32) -> Result<()>;

    /// Live executor processes recorded for one workflow.
    fn live_count(&self, adw_id: &str) -> usize;

    /// Live counts for every workflow with at least one record, in one pass.
    fn live_counts(&self) -> HashMap<String, usize>;

    fn is_alive(&self, adw_id: &str) -> bool {
        self.live_count(adw_id) > 0
    }
}

/// Whether a process with this pid currently exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// [`ProcessRegistry`] persisted as pid files next to the state records.
#[derive(Debug, Clone)]
pub struct PidFileRegistry {
    root: PathBuf,
}

impl PidFileRegistry {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into(),
        }
    }

    fn pids_dir(&self, adw_id: &str) -> PathBuf {
        self.root.join(adw_id).join(PIDS_DIR)
    }

    /// Count live pids for one workflow, deleting records of dead ones.
    fn scan(&self, adw_id: &str) -> usize {
        let Ok(entries) = fs::read_dir(self.pids_dir(adw_id)) else {
            return 0;
        };
        let mut live = 0;
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if pid_alive(pid) {
                live += 1;
            } else {
                debug!(adw_id, pid, "pruning record of exited executor");
                let _ = fs::remove_file(entry.path());
            }
        }
        live
    }
}

impl ProcessRegistry for PidFileRegistry {
    fn register(&self, adw_id: &str, pid: u32, phase: Phase) -> Result<()> {
        let dir = self.pids_dir(adw_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        fs::write(dir.join(pid.to_string()), phase.as_str())
            .with_context(|| format!("Failed to record pid {} for {}", pid, adw_id))?;
        Ok(())
    }

    fn unregister(&self, adw_id: &str, pid: u32) -> Result<()> {
        let path = self.pids_dir(adw_id).join(pid.to_string());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    fn live_count(&self, adw_id: &str) -> usize {
        self.scan(adw_id)
    }

    fn live_counts(&self) -> HashMap<String, usize> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return HashMap::new();
        };
        entries
            .flatten()
            .filter(|e| e.path().join(PIDS_DIR).is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .map(|adw_id| {
                let count = self.scan(&adw_id);
                (adw_id, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // Far above any real pid_max.
    const DEAD_PID: u32 = 2_000_000_000;

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_impossible_pid_is_dead() {
        assert!(!pid_alive(DEAD_PID));
        assert!(!pid_alive(0));
    }

    #[test]
    fn test_register_and_count() {
        let dir = tempdir().unwrap();
        let registry = PidFileRegistry::new(dir.path());
        assert!(!registry.is_alive("w1"));

        registry
            .register("w1", std::process::id(), Phase::Build)
            .unwrap();
        assert_eq!(registry.live_count("w1"), 1);
        assert!(registry.is_alive("w1"));

        registry.unregister("w1", std::process::id()).unwrap();
        assert!(!registry.is_alive("w1"));
        registry.unregister("w1", std::process::id()).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_pids_are_pruned() {
        let dir = tempdir().unwrap();
        let registry = PidFileRegistry::new(dir.path());
        registry.register("w1", DEAD_PID, Phase::Test).unwrap();
        assert_eq!(registry.live_count("w1"), 0);
        assert!(!dir.path().join("w1/pids").join(DEAD_PID.to_string()).exists());
    }

    #[test]
    fn test_live_counts_is_batched_over_all_workflows() {
        let dir = tempdir().unwrap();
        let registry = PidFileRegistry::new(dir.path());
        registry
            .register("w1", std::process::id(), Phase::Plan)
            .unwrap();
        registry
            .register("w2", std::process::id(), Phase::Build)
            .unwrap();
        std::fs::create_dir_all(dir.path().join("w3")).unwrap();

        let counts = registry.live_counts();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts["w1"], 1);
        assert_eq!(counts["w2"], 1);
    }
}
