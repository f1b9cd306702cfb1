use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ExecutorConfig;
use crate::errors::OrchestratorError;
use crate::phase::Phase;
use crate::process::ProcessRegistry;

/// Everything an executor needs to run one attempt of one phase.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub adw_id: String,
    pub issue_ref: String,
    pub phase: Phase,
    pub attempt: u32,
    /// Directory the executor starts in.
    pub working_dir: PathBuf,
    /// Where the executor's combined output is appended.
    pub log_file: Option<PathBuf>,
    pub worktree_path: Option<String>,
    pub ports: Option<(u16, u16)>,
    /// Extra flags such as `--no-external` or `--skip-e2e`.
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a phase to completion. The orchestrator only looks at the exit code.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, OrchestratorError>;
}

/// [`PhaseExecutor`] that launches the configured script as a subprocess:
/// `<program> <args with {phase} substituted> <issue_ref> <adw_id> <flags>`.
pub struct ScriptExecutor {
    config: ExecutorConfig,
    registry: Arc<dyn ProcessRegistry>,
}

impl ScriptExecutor {
    pub fn new(config: ExecutorConfig, registry: Arc<dyn ProcessRegistry>) -> Self {
        Self { config, registry }
    }

    /// Full argument vector (without the program) for a context.
    pub fn build_args(&self, ctx: &ExecutionContext) -> Vec<String> {
        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| a.replace("{phase}", ctx.phase.as_str()))
            .collect();
        args.push(ctx.issue_ref.clone());
        args.push(ctx.adw_id.clone());
        args.extend(ctx.flags.iter().cloned());
        args
    }

    fn output_stdio(&self, ctx: &ExecutionContext) -> (Stdio, Stdio) {
        let Some(ref path) = ctx.log_file else {
            return (Stdio::null(), Stdio::null());
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let opened = OpenOptions::new().create(true).append(true).open(path);
        match opened.and_then(|f| Ok((f.try_clone()?, f))) {
            Ok((out, err)) => (Stdio::from(out), Stdio::from(err)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open executor log, discarding output");
                (Stdio::null(), Stdio::null())
            }
        }
    }
}

#[async_trait]
impl PhaseExecutor for ScriptExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, OrchestratorError> {
        let args = self.build_args(ctx);
        let (stdout, stderr) = self.output_stdio(ctx);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&args)
            .current_dir(&ctx.working_dir)
            .env("ADW_ID", &ctx.adw_id)
            .env("ADW_PHASE", ctx.phase.as_str())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        if let Some(ref tree) = ctx.worktree_path {
            cmd.env("ADW_WORKTREE", tree);
        }
        if let Some((backend, frontend)) = ctx.ports {
            cmd.env("BACKEND_PORT", backend.to_string())
                .env("FRONTEND_PORT", frontend.to_string());
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| OrchestratorError::Spawn {
            phase: ctx.phase.to_string(),
            source,
        })?;

        let pid = child.id();
        if let Some(pid) = pid {
            if let Err(e) = self.registry.register(&ctx.adw_id, pid, ctx.phase) {
                warn!(adw_id = %ctx.adw_id, pid, error = %e, "failed to record executor pid");
            }
        }
        info!(
            adw_id = %ctx.adw_id,
            phase = %ctx.phase,
            attempt = ctx.attempt,
            pid = pid.unwrap_or(0),
            "spawned {} {}",
            self.config.program,
            args.join(" ")
        );

        let waited = match self.config.phase_timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), child.wait()).await {
                Ok(status) => status.map(|s| s.code().unwrap_or(-1)),
                Err(_) => {
                    warn!(adw_id = %ctx.adw_id, phase = %ctx.phase, secs, "executor timed out, killing");
                    let _ = child.kill().await;
                    Ok(-1)
                }
            },
            None => child.wait().await.map(|s| s.code().unwrap_or(-1)),
        };

        if let Some(pid) = pid {
            if let Err(e) = self.registry.unregister(&ctx.adw_id, pid) {
                warn!(adw_id = %ctx.adw_id, pid, error = %e, "failed to remove executor pid record");
            }
        }

        let exit_code = waited.map_err(|e| OrchestratorError::Other(e.into()))?;
        let duration = start.elapsed();
        info!(
            adw_id = %ctx.adw_id,
            phase = %ctx.phase,
            exit_code,
            secs = duration.as_secs_f64(),
            "executor finished"
        );
        Ok(ExecutionOutcome {
            exit_code,
            duration,
        })
    }
}
