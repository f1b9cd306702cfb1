pub mod allocator;
pub mod config;
pub mod errors;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod phase;
pub mod process;
pub mod server;
pub mod state;
pub mod tracker;
pub mod worktree;
