//! Loop detector guarding pipeline runs.
//!
//! Every failed attempt posts a comment carrying the retry marker to the
//! workflow's issue. Before a run starts, the detector counts markers in the
//! most recent messages; enough of them means the workflow has been failing
//! and restarting in a loop, and the run is refused outright.

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::errors::OrchestratorError;
use crate::tracker::IssueTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDetector {
    marker: String,
    window: usize,
    threshold: usize,
}

impl LoopDetector {
    pub fn new(marker: &str, window: usize, threshold: usize) -> Self {
        Self {
            marker: marker.to_string(),
            window,
            threshold,
        }
    }

    pub fn from_config(retry: &RetryConfig) -> Self {
        Self::new(&retry.loop_marker, retry.loop_window, retry.loop_threshold)
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Marker occurrences across the last `window` messages.
    pub fn count_markers<S: AsRef<str>>(&self, messages: &[S]) -> usize {
        if self.marker.is_empty() {
            return 0;
        }
        let skip = messages.len().saturating_sub(self.window);
        messages[skip..]
            .iter()
            .map(|m| m.as_ref().matches(self.marker.as_str()).count())
            .sum()
    }

    /// Trips iff the marker count reaches the threshold.
    pub fn check<S: AsRef<str>>(&self, messages: &[S]) -> Result<(), OrchestratorError> {
        let count = self.count_markers(messages);
        if count >= self.threshold {
            return Err(OrchestratorError::LoopDetected {
                count,
                threshold: self.threshold,
                window: self.window,
            });
        }
        debug!(count, threshold = self.threshold, "loop detector clear");
        Ok(())
    }

    /// Fetch the issue's recent messages and [`check`](Self::check) them.
    /// A tracker failure lets the run proceed.
    pub async fn inspect(
        &self,
        tracker: &dyn IssueTracker,
        issue_ref: &str,
    ) -> Result<(), OrchestratorError> {
        match tracker.recent_comments(issue_ref, self.window).await {
            Ok(messages) => self.check(&messages),
            Err(e) => {
                warn!(issue = issue_ref, error = %e, "could not read issue history, loop detector skipped");
                Ok(())
            }
        }
    }

    /// Body of the comment posted for a failed attempt.
    pub fn retry_comment(&self, adw_id: &str, phase: &str, attempt: u32, max_attempts: u32) -> String {
        format!(
            "{} {}: phase `{}` failed on attempt {}/{}, retrying",
            self.marker, adw_id, phase, attempt, max_attempts
        )
    }
}
