//! Core domain models for swarm orchestration.
//!
//! This module holds the task model and the validated dependency graph
//! that the orchestrator schedules from.

pub mod dag;
pub mod task;

pub use dag::{Plan, PlanSpec};
pub use task::{SkipReason, Task, TaskId, TaskSpec, TaskStatus};
