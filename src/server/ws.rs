use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::monitor::SnapshotHandle;

use super::api::AppState;
use super::broadcaster::WsMessage;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Subscribe before reading the snapshot so no transition published in
/// between is missed; the client may see it twice, which is harmless.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, receiver) = socket.split();
    let rx = state.broadcaster.subscribe();

    if let Some(json) = initial_message(&state.snapshots).await {
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    debug!(subscribers = state.broadcaster.subscriber_count(), "subscriber connected");
    run_socket_loop(sender, receiver, rx).await;
    debug!("subscriber disconnected");
}

/// The update message every new subscriber receives first.
async fn initial_message(snapshots: &SnapshotHandle) -> Option<String> {
    let snapshot = match snapshots.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "no initial snapshot for subscriber");
            return None;
        }
    };
    serde_json::to_string(&WsMessage::Update(snapshot))
        .map_err(|e| warn!(error = %e, "failed to serialize initial snapshot"))
        .ok()
}

/// Forward broadcasts, answer client frames and keep the connection alive
/// with pings. Exits when no Pong arrives within [`PONG_TIMEOUT`].
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("subscriber missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Later snapshots supersede the missed ones.
                        debug!(skipped, "subscriber lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{RefresherConfig, StatusAggregator, spawn_refresher};
    use crate::phase::WorkflowTemplate;
    use crate::process::PidFileRegistry;
    use crate::state::{WorkflowState, WorkflowStateStore};
    use crate::tracker::MemoryTracker;
    use tempfile::tempdir;

    fn refresher(store: &WorkflowStateStore) -> (SnapshotHandle, tokio::task::JoinHandle<()>) {
        let aggregator = StatusAggregator::new(
            store.clone(),
            Arc::new(PidFileRegistry::new(store.root())),
            Arc::new(MemoryTracker::new()),
            Duration::from_secs(600),
            Duration::from_secs(60),
        );
        spawn_refresher(
            aggregator,
            RefresherConfig::new(Duration::from_secs(5), Duration::from_secs(3600)),
        )
    }

    #[tokio::test]
    async fn test_subscriber_first_receives_current_snapshot() {
        let dir = tempdir().unwrap();
        let store = WorkflowStateStore::new(dir.path().join("agents"));
        store
            .save(&WorkflowState::new("w1", "42", WorkflowTemplate::Sdlc))
            .unwrap();
        let (snapshots, _task) = refresher(&store);

        let json = initial_message(&snapshots).await.unwrap();
        let msg: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(msg["type"], "update");
        assert_eq!(msg["data"]["summary"]["total"], 1);
        assert_eq!(msg["data"]["workflows"][0]["adw_id"], "w1");
    }

    #[tokio::test]
    async fn test_no_initial_message_without_refresher() {
        let dir = tempdir().unwrap();
        let store = WorkflowStateStore::new(dir.path().join("agents"));
        let (snapshots, task) = refresher(&store);
        task.abort();
        let _ = task.await;

        assert!(initial_message(&snapshots).await.is_none());
    }
}
