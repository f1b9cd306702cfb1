//! Issue-tracker boundary.
//!
//! The orchestrator only needs three things from the tracker: whether an
//! issue is closed, the most recent comments (for the loop detector) and a
//! way to post a comment. [`GhCliTracker`] talks to GitHub through the `gh`
//! CLI; [`MemoryTracker`] keeps everything in process for offline runs and
//! tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn issue_state(&self, issue_ref: &str) -> Result<IssueState>;

    /// Bodies of the last `limit` comments, oldest first.
    async fn recent_comments(&self, issue_ref: &str, limit: usize) -> Result<Vec<String>>;

    async fn post_comment(&self, issue_ref: &str, body: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct GhIssueView {
    state: String,
    #[serde(default)]
    comments: Vec<GhComment>,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    #[serde(default)]
    body: String,
}

/// [`IssueTracker`] over the `gh` CLI. Every call is bounded by `timeout`.
pub struct GhCliTracker {
    repo: Option<String>,
    timeout: Duration,
}

impl GhCliTracker {
    pub fn new(repo: Option<String>, timeout: Duration) -> Self {
        Self { repo, timeout }
    }

    async fn gh(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("gh");
        cmd.args(args);
        if let Some(ref repo) = self.repo {
            cmd.args(["--repo", repo]);
        }
        cmd.kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("gh {} timed out after {:?}", args.join(" "), self.timeout))?
            .context("Failed to run gh")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("gh {} failed: {}", args.join(" "), stderr.trim());
        }
        String::from_utf8(output.stdout).context("Invalid UTF-8 in gh output")
    }

    async fn view(&self, issue_ref: &str, fields: &str) -> Result<GhIssueView> {
        let json = self
            .gh(&["issue", "view", issue_ref, "--json", fields])
            .await?;
        serde_json::from_str(&json).context("Failed to parse gh issue view output")
    }
}

#[async_trait]
impl IssueTracker for GhCliTracker {
    async fn issue_state(&self, issue_ref: &str) -> Result<IssueState> {
        let view = self.view(issue_ref, "state").await?;
        Ok(parse_issue_state(&view.state))
    }

    async fn recent_comments(&self, issue_ref: &str, limit: usize) -> Result<Vec<String>> {
        let view = self.view(issue_ref, "state,comments").await?;
        let skip = view.comments.len().saturating_sub(limit);
        Ok(view.comments.into_iter().skip(skip).map(|c| c.body).collect())
    }

    async fn post_comment(&self, issue_ref: &str, body: &str) -> Result<()> {
        self.gh(&["issue", "comment", issue_ref, "--body", body])
            .await
            .map(|_| ())
    }
}

fn parse_issue_state(raw: &str) -> IssueState {
    if raw.eq_ignore_ascii_case("closed") {
        IssueState::Closed
    } else {
        IssueState::Open
    }
}

/// In-process [`IssueTracker`]. Issues are open unless closed explicitly.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    closed: Mutex<Vec<String>>,
    comments: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self, issue_ref: &str) {
        if let Ok(mut closed) = self.closed.lock() {
            closed.push(issue_ref.to_string());
        }
    }

    pub fn comments_for(&self, issue_ref: &str) -> Vec<String> {
        self.comments
            .lock()
            .map(|c| c.get(issue_ref).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IssueTracker for MemoryTracker {
    async fn issue_state(&self, issue_ref: &str) -> Result<IssueState> {
        let closed = self
            .closed
            .lock()
            .map_err(|_| anyhow::anyhow!("tracker lock poisoned"))?;
        Ok(if closed.iter().any(|i| i == issue_ref) {
            IssueState::Closed
        } else {
            IssueState::Open
        })
    }

    async fn recent_comments(&self, issue_ref: &str, limit: usize) -> Result<Vec<String>> {
        let all = self.comments_for(issue_ref);
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn post_comment(&self, issue_ref: &str, body: &str) -> Result<()> {
        self.comments
            .lock()
            .map_err(|_| anyhow::anyhow!("tracker lock poisoned"))?
            .entry(issue_ref.to_string())
            .or_default()
            .push(body.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_issue_state() {
        assert_eq!(parse_issue_state("CLOSED"), IssueState::Closed);
        assert_eq!(parse_issue_state("OPEN"), IssueState::Open);
        assert_eq!(parse_issue_state("weird"), IssueState::Open);
    }

    #[test]
    fn test_gh_issue_view_parses() {
        let json = r#"{"state":"OPEN","comments":[{"body":"a","author":{"login":"x"}},{"body":"b"}]}"#;
        let view: GhIssueView = serde_json::from_str(json).unwrap();
        assert_eq!(view.state, "OPEN");
        assert_eq!(view.comments.len(), 2);
        assert_eq!(view.comments[1].body, "b");
    }

    #[tokio::test]
    async fn test_memory_tracker_keeps_last_comments() {
        let tracker = MemoryTracker::new();
        for i in 0..5 {
            tracker.post_comment("7", &format!("c{i}")).await.unwrap();
        }
        let last = tracker.recent_comments("7", 3).await.unwrap();
        assert_eq!(last, vec!["c2", "c3", "c4"]);
        assert!(tracker.recent_comments("8", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_tracker_close() {
        let tracker = MemoryTracker::new();
        assert_eq!(tracker.issue_state("1").await.unwrap(), IssueState::Open);
        tracker.close("1");
        assert_eq!(tracker.issue_state("1").await.unwrap(), IssueState::Closed);
    }
}
