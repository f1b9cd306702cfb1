//! Where phase transitions go once the orchestrator has persisted them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::phase::Phase;
use crate::state::WorkflowStatus;

const HTTP_SINK_TIMEOUT: Duration = Duration::from_secs(2);

/// What happened at a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    #[default]
    Update,
    Started,
    Completed,
    /// An attempt failed and the phase is about to be re-run.
    Retry,
    /// A phase succeeded after at least one failed attempt.
    Recovered,
    /// A non-critical phase ran out of retries and was passed over.
    Skipped,
    Failed,
}

/// Body of the phase-update push endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseUpdate {
    pub adw_id: String,
    pub current_phase: Phase,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub event: TransitionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl PhaseUpdate {
    pub fn new(adw_id: &str, phase: Phase, status: WorkflowStatus, event: TransitionKind) -> Self {
        Self {
            adw_id: adw_id.to_string(),
            current_phase: phase,
            status,
            event,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Receives transitions. Delivery is best effort: implementations log and
/// swallow their own failures so a dead observer never stalls a pipeline.
#[async_trait]
pub trait TransitionSink: Send + Sync {
    async fn emit(&self, update: PhaseUpdate);
}

/// Drops every transition.
pub struct NullSink;

#[async_trait]
impl TransitionSink for NullSink {
    async fn emit(&self, update: PhaseUpdate) {
        debug!(adw_id = %update.adw_id, phase = %update.current_phase, event = ?update.event, "transition (no sink)");
    }
}

/// POSTs transitions to a running monitor's phase-update endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_SINK_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl TransitionSink for HttpSink {
    async fn emit(&self, update: PhaseUpdate) {
        match self.client.post(&self.url).json(&update).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(url = %self.url, status = %resp.status(), "monitor rejected phase update"),
            Err(e) => debug!(url = %self.url, error = %e, "monitor unreachable, dropping phase update"),
        }
    }
}

/// Collects transitions in memory.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    pub updates: std::sync::Mutex<Vec<PhaseUpdate>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<(Phase, TransitionKind)> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|u| (u.current_phase, u.event))
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl TransitionSink for RecordingSink {
    async fn emit(&self, update: PhaseUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}
