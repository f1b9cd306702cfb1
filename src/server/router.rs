use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::ws;

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl+C.
pub async fn start_server(state: Arc<AppState>, port: u16) -> Result<()> {
    let app = build_router(state);

    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "monitor listening");
    println!("ADW monitor running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("monitor shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl+C handler; serving until killed");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::monitor::{HealthChecker, RefresherConfig, StatusAggregator, spawn_refresher};
    use crate::process::PidFileRegistry;
    use crate::server::EventBroadcaster;
    use crate::state::WorkflowStateStore;
    use crate::tracker::MemoryTracker;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router(dir: &std::path::Path) -> Router {
        let store = WorkflowStateStore::new(dir.join("agents"));
        let registry = Arc::new(PidFileRegistry::new(store.root()));
        let aggregator = StatusAggregator::new(
            store.clone(),
            registry.clone(),
            Arc::new(MemoryTracker::new()),
            Duration::from_secs(600),
            Duration::from_secs(60),
        );
        let (snapshots, _task) = spawn_refresher(
            aggregator,
            RefresherConfig::new(Duration::from_secs(5), Duration::from_secs(3600)),
        );
        build_router(Arc::new(AppState {
            store: store.clone(),
            snapshots: snapshots.clone(),
            health: Arc::new(HealthChecker::new(
                store.clone(),
                registry,
                dir,
                MonitorConfig::default(),
            )),
            broadcaster: Arc::new(EventBroadcaster::new(store, snapshots, 16)),
        }))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let dir = tempfile::tempdir().unwrap();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = test_router(dir.path()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = test_router(dir.path()).oneshot(req).await.unwrap();
        // A plain GET without upgrade headers is rejected, but the route exists.
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_cors_headers_present() {
        let dir = tempfile::tempdir().unwrap();
        let req = Request::builder()
            .uri("/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = test_router(dir.path()).oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let req = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let resp = test_router(dir.path()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
