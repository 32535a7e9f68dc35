//! The agent runner boundary.
//!
//! The orchestrator hands each dispatched task to an [`AgentRunner`] and only
//! sees the returned [`AgentOutcome`]. [`SimulatedRunner`] is a scripted
//! runner used for demo runs and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::{TaskId, TaskSpec};
use crate::error::Result;

/// Whether an execution succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum OutcomeStatus {
    Succeeded,
    Failed { error: String },
}

/// What one agent execution reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub status: OutcomeStatus,
    /// Cost incurred, in USD, whether or not the execution succeeded.
    pub cost_usd: f64,
    /// Opaque output payload.
    pub output: String,
}

impl AgentOutcome {
    pub fn succeeded(output: impl Into<String>, cost_usd: f64) -> Self {
        Self {
            status: OutcomeStatus::Succeeded,
            cost_usd,
            output: output.into(),
        }
    }

    pub fn failed(error: impl Into<String>, cost_usd: f64) -> Self {
        Self {
            status: OutcomeStatus::Failed {
                error: error.into(),
            },
            cost_usd,
            output: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Succeeded)
    }
}

/// Executes a single task with an agent.
///
/// An `Err` is treated by the orchestrator as a failed execution with no
/// reported cost.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn execute(&self, task: &TaskSpec) -> Result<AgentOutcome>;
}

/// Scripted behaviour for one task in a [`SimulatedRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    /// Number of leading attempts that fail; `u32::MAX` fails forever.
    pub failing_attempts: u32,
    /// Cost reported by every attempt.
    pub cost_usd: f64,
    /// Time each attempt takes.
    pub delay: Duration,
}

impl Script {
    pub fn succeed(cost_usd: f64) -> Self {
        Self {
            failing_attempts: 0,
            cost_usd,
            delay: Duration::ZERO,
        }
    }

    pub fn fail(cost_usd: f64) -> Self {
        Self {
            failing_attempts: u32::MAX,
            ..Self::succeed(cost_usd)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Deterministic runner whose outcomes are fixed per task id.
#[derive(Debug)]
pub struct SimulatedRunner {
    default: Script,
    scripts: HashMap<TaskId, Script>,
    attempts: Mutex<HashMap<TaskId, u32>>,
    log: Mutex<Vec<TaskId>>,
}

impl SimulatedRunner {
    /// Every task succeeds with `default`'s cost and delay unless scripted.
    pub fn new(default: Script) -> Self {
        Self {
            default,
            scripts: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Runner used by `swarm run --demo`.
    pub fn demo() -> Self {
        Self::new(Script::succeed(0.02).with_delay(Duration::from_millis(400)))
    }

    pub fn script(mut self, id: impl Into<TaskId>, script: Script) -> Self {
        self.scripts.insert(id.into(), script);
        self
    }

    /// Make `id` fail on every attempt.
    pub fn failing(self, id: impl Into<TaskId>) -> Self {
        let script = Script {
            failing_attempts: u32::MAX,
            ..self.default.clone()
        };
        self.script(id, script)
    }

    /// Make `id` fail on its first `attempts` attempts, then succeed.
    pub fn flaky(self, id: impl Into<TaskId>, attempts: u32) -> Self {
        let script = Script {
            failing_attempts: attempts,
            ..self.default.clone()
        };
        self.script(id, script)
    }

    /// Task ids in the order their executions began.
    pub async fn executions(&self) -> Vec<TaskId> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl AgentRunner for SimulatedRunner {
    async fn execute(&self, task: &TaskSpec) -> Result<AgentOutcome> {
        let script = self.scripts.get(&task.id).unwrap_or(&self.default);
        self.log.lock().await.push(task.id.clone());
        let attempt = {
            let mut attempts = self.attempts.lock().await;
            let count = attempts.entry(task.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        if attempt <= script.failing_attempts {
            Ok(AgentOutcome::failed(
                format!("simulated failure of {} (attempt {})", task.id, attempt),
                script.cost_usd,
            ))
        } else {
            Ok(AgentOutcome::succeeded(
                format!("simulated output of {}", task.id),
                script.cost_usd,
            ))
        }
    }
}
