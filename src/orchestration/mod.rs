//! Orchestration layer for the swarm.
//!
//! This module holds the pieces the control loop coordinates: the resource
//! lock table, the budget meter, the agent runner boundary, lifecycle
//! events and the [`Orchestrator`] itself, plus the post-run
//! [`QualityGate`].

mod budget;
mod claude;
mod events;
mod locks;
mod quality;
mod runner;
mod scheduler;

pub use budget::BudgetMeter;
pub use claude::ClaudeRunner;
pub use events::{EventRecorder, EventSink, MemorySink, NullSink, RecordedEvent, RunEvent};
pub use locks::{LockOutcome, ResourceLock, ResourceLockTable};
pub use quality::{review_prompt, QualityGate, QualityReport, TaskReview, Verdict};
pub use runner::{AgentOutcome, AgentRunner, OutcomeStatus, Script, SimulatedRunner};
pub use scheduler::{
    run, Orchestrator, ResourceConflict, RunConfig, RunResult, StopReason, TaskReport,
};
