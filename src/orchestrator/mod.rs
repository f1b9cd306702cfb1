pub mod breaker;
pub mod executor;
pub mod runner;
pub mod sink;

pub use breaker::LoopDetector;
pub use executor::{ExecutionContext, ExecutionOutcome, PhaseExecutor, ScriptExecutor};
pub use runner::{CleanupReport, PhaseOrchestrator, PhaseOutcome, RunRequest, RunSummary};
pub use sink::{HttpSink, NullSink, PhaseUpdate, TransitionKind, TransitionSink};
