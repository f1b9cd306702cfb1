//! Monitoring service: status and health over HTTP, live updates over WebSocket.
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────┐
//! │ Observer │ ───────> │  router.rs  (axum Router, start_server)      │
//! │          │ <─────── │    ├─ api.rs  (handlers, AppState)           │
//! └──────────┘ WebSocket│    └─ ws.rs   (subscription loop)            │
//!      ^                │            │                                 │
//!      │                │            v                                 │
//! ┌──────────┐  POST    │  broadcaster.rs (persist, refresh, fan out)  │
//! │ adw run  │ ───────> │            │                                 │
//! └──────────┘          │            v                                 │
//!                       │  monitor::SnapshotHandle (cached snapshot)   │
//!                       └──────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod broadcaster;
pub mod router;
pub mod ws;

pub use api::{AppState, SharedState};
pub use broadcaster::{EventBroadcaster, WsMessage};
pub use router::{build_router, start_server};
