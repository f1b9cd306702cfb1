//! Unified configuration for ADW.
//!
//! Reads `.adw/adw.toml` from the project directory and layers it:
//! built-in defaults → file → environment (`ADW_*`, `.env` honoured) → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [paths]
//! state_dir = "agents"
//! trees_dir = "trees"
//!
//! [ports]
//! backend_start = 9100
//! frontend_start = 9200
//! pool_size = 15
//!
//! [retry]
//! critical_retries = 2
//! non_critical_retries = 1
//! loop_marker = "[adw-retry]"
//! loop_window = 20
//! loop_threshold = 12
//!
//! [monitor]
//! stale_after_secs = 600
//! status_ttl_secs = 5
//! issue_ttl_secs = 60
//! port_conflict_ttl_secs = 60
//! refresh_interval_secs = 5
//! probe_timeout_secs = 3
//! max_processes = 3
//!
//! [executor]
//! program = "uv"
//! args = ["run", "adws/adw_{phase}_iso.py"]
//!
//! [server]
//! port = 8000
//! notify_url = "http://127.0.0.1:8000/api/workflow-updates"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Name of the directory holding `adw.toml` and logs.
pub const CONFIG_DIR: &str = ".adw";
pub const CONFIG_FILE: &str = "adw.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the state records, relative to the project directory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Root of the per-workflow worktrees.
    #[serde(default = "default_trees_dir")]
    pub trees_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("agents")
}

fn default_trees_dir() -> PathBuf {
    PathBuf::from("trees")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            trees_dir: default_trees_dir(),
        }
    }
}

/// Port-pair pool. Slot `i` is `(backend_start + i, frontend_start + i)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_backend_start")]
    pub backend_start: u16,
    #[serde(default = "default_frontend_start")]
    pub frontend_start: u16,
    #[serde(default = "default_pool_size")]
    pub pool_size: u16,
}

fn default_backend_start() -> u16 {
    9100
}

fn default_frontend_start() -> u16 {
    9200
}

fn default_pool_size() -> u16 {
    15
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            backend_start: default_backend_start(),
            frontend_start: default_frontend_start(),
            pool_size: default_pool_size(),
        }
    }
}

/// Retry budget per phase criticality and the loop detector's thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_critical_retries")]
    pub critical_retries: u32,
    #[serde(default = "default_non_critical_retries")]
    pub non_critical_retries: u32,
    /// Token written into retry notifications and counted by the loop detector.
    #[serde(default = "default_loop_marker")]
    pub loop_marker: String,
    /// How many recent issue messages the loop detector inspects.
    #[serde(default = "default_loop_window")]
    pub loop_window: usize,
    /// Marker count at which the loop detector trips.
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,
}

fn default_critical_retries() -> u32 {
    2
}

fn default_non_critical_retries() -> u32 {
    1
}

fn default_loop_marker() -> String {
    "[adw-retry]".to_string()
}

fn default_loop_window() -> usize {
    20
}

fn default_loop_threshold() -> usize {
    12
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            critical_retries: default_critical_retries(),
            non_critical_retries: default_non_critical_retries(),
            loop_marker: default_loop_marker(),
            loop_window: default_loop_window(),
            loop_threshold: default_loop_threshold(),
        }
    }
}

impl RetryConfig {
    /// Retries allowed after the first attempt of `phase`.
    pub fn retries_for(&self, phase: Phase) -> u32 {
        if phase.is_critical() {
            self.critical_retries
        } else {
            self.non_critical_retries
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_status_ttl_secs")]
    pub status_ttl_secs: u64,
    #[serde(default = "default_issue_ttl_secs")]
    pub issue_ttl_secs: u64,
    #[serde(default = "default_issue_ttl_secs")]
    pub port_conflict_ttl_secs: u64,
    #[serde(default = "default_status_ttl_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Matching executor processes above this count raise a warning.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
}

fn default_stale_after_secs() -> u64 {
    600
}

fn default_status_ttl_secs() -> u64 {
    5
}

fn default_issue_ttl_secs() -> u64 {
    60
}

fn default_probe_timeout_secs() -> u64 {
    3
}

fn default_max_processes() -> usize {
    3
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            status_ttl_secs: default_status_ttl_secs(),
            issue_ttl_secs: default_issue_ttl_secs(),
            port_conflict_ttl_secs: default_issue_ttl_secs(),
            refresh_interval_secs: default_status_ttl_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            max_processes: default_max_processes(),
        }
    }
}

impl MonitorConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn issue_ttl(&self) -> Duration {
        Duration::from_secs(self.issue_ttl_secs)
    }

    pub fn port_conflict_ttl(&self) -> Duration {
        Duration::from_secs(self.port_conflict_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// How a phase executor is launched. `{phase}` in any argument is replaced
/// with the phase name; `issue_ref` and `adw_id` are appended positionally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Optional wall-clock limit per attempt. Absent means wait for exit.
    #[serde(default)]
    pub phase_timeout_secs: Option<u64>,
}

fn default_program() -> String {
    "uv".to_string()
}

fn default_args() -> Vec<String> {
    vec!["run".to_string(), "adws/adw_{phase}_iso.py".to_string()]
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            phase_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Where orchestrator processes POST phase transitions. `None` disables.
    #[serde(default = "default_notify_url")]
    pub notify_url: Option<String>,
}

fn default_server_port() -> u16 {
    8000
}

fn default_notify_url() -> Option<String> {
    Some(format!(
        "http://127.0.0.1:{}/api/workflow-updates",
        default_server_port()
    ))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            notify_url: default_notify_url(),
        }
    }
}

/// The full configuration tree as it appears in `adw.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdwConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Project directory the relative paths resolve against.
    #[serde(skip)]
    pub project_dir: PathBuf,
}

impl AdwConfig {
    /// Load `<project_dir>/.adw/adw.toml` (if present) and apply environment overrides.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let _ = dotenvy::from_path(project_dir.join(".env"));

        let config_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            Self::default()
        };
        config.project_dir = project_dir.to_path_buf();
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid adw.toml")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("ADW_STATE_DIR") {
            self.paths.state_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("ADW_TREES_DIR") {
            self.paths.trees_dir = PathBuf::from(dir);
        }
        if let Some(port) = std::env::var("ADW_SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.server.port = port;
        }
        if let Ok(url) = std::env::var("ADW_NOTIFY_URL") {
            self.server.notify_url = (!url.is_empty()).then_some(url);
        }
        if let Ok(program) = std::env::var("ADW_EXECUTOR") {
            self.executor.program = program;
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(&self.paths.state_dir)
    }

    pub fn trees_dir(&self) -> PathBuf {
        self.project_dir.join(&self.paths.trees_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.project_dir.join(CONFIG_DIR).join("logs")
    }

    /// Warnings about settings that are legal but probably wrong.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.ports.pool_size == 0 {
            warnings.push("ports.pool_size is 0: every allocation will fail".to_string());
        }
        let backend_end = u32::from(self.ports.backend_start) + u32::from(self.ports.pool_size);
        let frontend_end = u32::from(self.ports.frontend_start) + u32::from(self.ports.pool_size);
        if backend_end > u32::from(u16::MAX) + 1 || frontend_end > u32::from(u16::MAX) + 1 {
            warnings.push("port pool extends past 65535".to_string());
        }
        let (lo, hi) = if self.ports.backend_start <= self.ports.frontend_start {
            (self.ports.backend_start, self.ports.frontend_start)
        } else {
            (self.ports.frontend_start, self.ports.backend_start)
        };
        if u32::from(lo) + u32::from(self.ports.pool_size) > u32::from(hi) {
            warnings.push("backend and frontend port ranges overlap".to_string());
        }
        if self.retry.loop_threshold > self.retry.loop_window {
            warnings.push(format!(
                "retry.loop_threshold ({}) exceeds retry.loop_window ({}): the loop detector can never trip",
                self.retry.loop_threshold, self.retry.loop_window
            ));
        }
        if self.retry.loop_marker.trim().is_empty() {
            warnings.push("retry.loop_marker is empty".to_string());
        }
        warnings
    }
}
