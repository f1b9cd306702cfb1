use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::StateError;
use crate::monitor::{SnapshotHandle, StatusSnapshot};
use crate::orchestrator::{PhaseUpdate, TransitionKind, TransitionSink};
use crate::state::{WorkflowState, WorkflowStateStore, WorkflowStatus};

/// Messages pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    Update(StatusSnapshot),
}

/// Fold a pushed transition into a record. Applying the same update twice
/// leaves the record as after the first; illegal moves are logged and ignored.
pub fn merge_update(state: &mut WorkflowState, update: &PhaseUpdate) {
    state.current_phase = Some(update.current_phase);

    if state.status.can_transition_to(update.status) {
        // Legal by the check above.
        let _ = state.transition(update.status);
    } else {
        warn!(
            adw_id = %state.adw_id,
            from = %state.status,
            to = %update.status,
            "ignoring illegal status in phase update"
        );
    }

    match update.event {
        TransitionKind::Completed | TransitionKind::Recovered
            if update.status != WorkflowStatus::Completed =>
        {
            if let Err(e) = state.complete_phase(update.current_phase) {
                warn!(adw_id = %state.adw_id, error = %e, "ignoring out-of-order phase completion");
            }
        }
        TransitionKind::Skipped => state.skip_phase(update.current_phase),
        TransitionKind::Failed => state.failed_phase = Some(update.current_phase),
        _ => {}
    }

    if let Some(msg) = update
        .metadata
        .as_ref()
        .and_then(|m| m.get("error"))
        .and_then(|e| e.as_str())
    {
        state.error = Some(msg.to_string());
    }
}

/// Fans phase transitions out to every subscribed observer.
pub struct EventBroadcaster {
    store: WorkflowStateStore,
    snapshots: SnapshotHandle,
    tx: broadcast::Sender<String>,
}

impl EventBroadcaster {
    pub fn new(store: WorkflowStateStore, snapshots: SnapshotHandle, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            store,
            snapshots,
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn snapshots(&self) -> &SnapshotHandle {
        &self.snapshots
    }

    /// Persist the transition, then push a fresh snapshot to subscribers.
    /// With nobody subscribed, nothing is computed after the write.
    pub async fn notify(&self, update: &PhaseUpdate) -> Result<(), StateError> {
        let current = self.store.load(&update.adw_id)?;
        let mut merged = current.clone();
        merge_update(&mut merged, update);
        if merged != current {
            self.store.save(&merged)?;
        }

        if self.tx.receiver_count() == 0 {
            debug!(adw_id = %update.adw_id, "no subscribers, skipping broadcast");
            return Ok(());
        }
        match self.snapshots.refresh().await {
            Ok(snapshot) => self.publish(snapshot),
            Err(e) => warn!(error = %e, "could not refresh snapshot for broadcast"),
        }
        Ok(())
    }

    fn publish(&self, snapshot: StatusSnapshot) {
        match serde_json::to_string(&WsMessage::Update(snapshot)) {
            Ok(json) => {
                // Err only means every receiver went away meanwhile.
                let delivered = self.tx.send(json).unwrap_or(0);
                debug!(delivered, "broadcast status update");
            }
            Err(e) => warn!(error = %e, "failed to serialize status update"),
        }
    }
}

#[async_trait]
impl TransitionSink for EventBroadcaster {
    async fn emit(&self, update: PhaseUpdate) {
        if let Err(e) = self.notify(&update).await {
            warn!(adw_id = %update.adw_id, error = %e, "failed to broadcast transition");
        }
    }
}
