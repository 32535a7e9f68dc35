//! Run lifecycle events and the sinks that receive them.
//!
//! The orchestrator emits events in the order state changes happen; it never
//! persists them itself. [`EventRecorder`] appends them to a JSONL file for
//! post-hoc replay.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::warn;

use crate::agent::AgentId;
use crate::core::{SkipReason, TaskId};
use crate::error::Result;
use crate::orchestration::quality::Verdict;
use crate::orchestration::runner::OutcomeStatus;
use crate::orchestration::scheduler::StopReason;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RunEvent {
    RunStarted {
        tasks: usize,
        waves: usize,
        max_concurrent: usize,
        /// `None` when the budget is unlimited.
        budget_ceiling: Option<f64>,
    },
    TaskReady {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        error: String,
        /// Cost of the failed attempt, already counted against the budget.
        cost_usd: f64,
    },
    TaskCompleted {
        task_id: TaskId,
        outcome: OutcomeStatus,
        cost_usd: f64,
        attempts: u32,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: SkipReason,
    },
    ResourceConflict {
        resource: String,
        holder: TaskId,
        waiting: TaskId,
    },
    BudgetExceeded {
        spent: f64,
        ceiling: f64,
    },
    RunFinished {
        stop_reason: StopReason,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        total_cost_usd: f64,
    },
    /// Emitted after the run, outside the control loop.
    QualityGate {
        overall_score: u8,
        verdict: Verdict,
        summary: String,
        review_cost_usd: f64,
    },
}

impl RunEvent {
    /// Snake-case event name, e.g. `task_started`.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::TaskReady { .. } => "task_ready",
            RunEvent::TaskStarted { .. } => "task_started",
            RunEvent::TaskRetrying { .. } => "task_retrying",
            RunEvent::TaskCompleted { .. } => "task_completed",
            RunEvent::TaskSkipped { .. } => "task_skipped",
            RunEvent::ResourceConflict { .. } => "resource_conflict",
            RunEvent::BudgetExceeded { .. } => "budget_exceeded",
            RunEvent::RunFinished { .. } => "run_finished",
            RunEvent::QualityGate { .. } => "quality_gate",
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            RunEvent::TaskReady { task_id }
            | RunEvent::TaskStarted { task_id, .. }
            | RunEvent::TaskRetrying { task_id, .. }
            | RunEvent::TaskCompleted { task_id, .. }
            | RunEvent::TaskSkipped { task_id, .. } => Some(task_id),
            RunEvent::ResourceConflict { waiting, .. } => Some(waiting),
            _ => None,
        }
    }
}

/// Receiver of run events. Must not block for long.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: RunEvent) {}
}

impl EventSink for mpsc::UnboundedSender<RunEvent> {
    fn emit(&self, event: RunEvent) {
        // A dropped receiver just means nobody is watching.
        let _ = self.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: RunEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// One line of a recorded event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Milliseconds since the recorder was created.
    pub elapsed_ms: u64,
    pub event: RunEvent,
}

/// Appends events as JSON lines to a file.
pub struct EventRecorder {
    file: Mutex<File>,
    started: Instant,
}

impl EventRecorder {
    /// Create (or truncate) the log at `path`, creating parent directories.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            started: Instant::now(),
        })
    }

    /// Read back a recorded log, skipping blank lines.
    pub fn load(path: &Path) -> Result<Vec<RecordedEvent>> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    fn write_line(&self, record: &RecordedEvent) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl EventSink for EventRecorder {
    fn emit(&self, event: RunEvent) {
        let record = RecordedEvent {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            event,
        };
        if let Err(e) = self.write_line(&record) {
            warn!(error = %e, event = record.event.name(), "failed to record event");
        }
    }
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder").finish_non_exhaustive()
    }
}
