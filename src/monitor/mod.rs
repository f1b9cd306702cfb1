pub mod cache;
pub mod health;
pub mod refresher;
pub mod status;

pub use cache::{Clock, ManualClock, SystemClock, TtlCache};
pub use health::{HealthChecker, HealthReport, ProbeResult, Severity};
pub use refresher::{RefresherConfig, SnapshotHandle, spawn_refresher};
pub use status::{
    DerivedStatus, StatusAggregator, StatusSnapshot, StatusSummary, WorkflowView, compute_progress,
    determine_status,
};
