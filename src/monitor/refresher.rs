//! Background task owning the status snapshot cache.
//!
//! The task is the only holder of the [`StatusAggregator`] and its cached
//! [`StatusSnapshot`]. It recomputes on a fixed interval and answers requests
//! sent over a channel, so readers never share the cache directly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::cache::{Clock, SystemClock, TtlCache};
use super::status::{StatusAggregator, StatusSnapshot};

enum Request {
    /// Cached snapshot, recomputed first if expired.
    Get(oneshot::Sender<StatusSnapshot>),
    /// Recompute now regardless of the cache.
    Refresh(oneshot::Sender<StatusSnapshot>),
}

/// Cheap, cloneable handle to the refresher task.
#[derive(Clone)]
pub struct SnapshotHandle {
    tx: mpsc::Sender<Request>,
}

impl SnapshotHandle {
    pub async fn snapshot(&self) -> Result<StatusSnapshot> {
        self.ask(Request::Get).await
    }

    pub async fn refresh(&self) -> Result<StatusSnapshot> {
        self.ask(Request::Refresh).await
    }

    async fn ask(&self, make: fn(oneshot::Sender<StatusSnapshot>) -> Request) -> Result<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .ok()
            .context("status refresher has stopped")?;
        rx.await.context("status refresher dropped the request")
    }
}

pub struct RefresherConfig {
    pub ttl: Duration,
    pub interval: Duration,
    pub clock: Arc<dyn Clock>,
}

impl RefresherConfig {
    pub fn new(ttl: Duration, interval: Duration) -> Self {
        Self {
            ttl,
            interval,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Start the refresher. The task ends once every handle is dropped.
pub fn spawn_refresher(aggregator: StatusAggregator, config: RefresherConfig) -> (SnapshotHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(run(aggregator, config, rx));
    (SnapshotHandle { tx }, task)
}

async fn run(mut aggregator: StatusAggregator, config: RefresherConfig, mut rx: mpsc::Receiver<Request>) {
    let mut cache: TtlCache<(), StatusSnapshot> = TtlCache::with_clock(config.ttl, config.clock);
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; use it to seed the cache.
    ticker.tick().await;
    cache.insert((), aggregator.snapshot().await);
    info!(ttl = ?config.ttl, interval = ?config.interval, "status refresher started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = aggregator.snapshot().await;
                debug!(total = snapshot.summary.total, "periodic status refresh");
                cache.insert((), snapshot);
            }
            request = rx.recv() => {
                let Some(request) = request else { break };
                let (reply, snapshot) = match request {
                    Request::Get(reply) => {
                        let snapshot = match cache.get(&()) {
                            Some(snapshot) => snapshot,
                            None => {
                                let fresh = aggregator.snapshot().await;
                                cache.insert((), fresh.clone());
                                fresh
                            }
                        };
                        (reply, snapshot)
                    }
                    Request::Refresh(reply) => {
                        let fresh = aggregator.snapshot().await;
                        cache.insert((), fresh.clone());
                        (reply, fresh)
                    }
                };
                // Requester may have gone away; nothing to do.
                let _ = reply.send(snapshot);
            }
        }
    }
    info!("status refresher stopped");
}
