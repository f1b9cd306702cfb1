//! Durable workflow state: the record type and its file-backed store.

pub mod record;
pub mod store;

pub use record::{WorkflowState, WorkflowStatus};
pub use store::{STATE_FILE_NAME, WorkflowStateStore, generate_adw_id, validate_adw_id};
