//! Task data model for the execution plan.
//!
//! A task is declared once as a [`TaskSpec`] (what the plan file says) and
//! carried through a run as a [`Task`], which adds lifecycle state, cost and
//! the result payload.

use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a task, unique within a single plan.
///
/// Plan authors choose these (e.g. `task-1`), so the id is a string rather
/// than a generated UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a task never ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SkipReason {
    /// A predecessor (direct or transitive) failed.
    DependencyFailed {
        /// The task whose failure caused the skip.
        task: TaskId,
    },
    /// The run stopped dispatching because the budget ceiling was reached.
    BudgetExceeded,
    /// The run was cancelled before the task was dispatched.
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::DependencyFailed { task } => write!(f, "dependency {} failed", task),
            SkipReason::BudgetExceeded => write!(f, "budget exceeded"),
            SkipReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Task status in its lifecycle.
///
/// `pending -> ready -> running -> {succeeded, failed}`, plus `skipped`
/// which is only reachable from `pending` or `ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting on at least one predecessor.
    #[default]
    Pending,
    /// Every predecessor succeeded; waiting for a slot and its locks.
    Ready,
    /// Dispatched to an agent.
    Running,
    /// The agent reported success.
    Succeeded,
    /// The agent reported failure, timed out, or crashed.
    Failed {
        /// Failure detail.
        error: String,
    },
    /// Never dispatched.
    Skipped {
        /// Why the task was skipped.
        reason: SkipReason,
    },
}

impl TaskStatus {
    /// `succeeded`, `failed` and `skipped` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }

    /// Short label without the failure/skip detail.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Skipped { .. } => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

fn default_agent_type() -> String {
    "coder".to_string()
}

/// A task as declared in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    /// Unique identifier within the plan.
    pub id: TaskId,
    /// Human-readable description of the work.
    pub description: String,
    /// Agent type tag, e.g. `coder`, `tester`, `reviewer`.
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    /// Tasks that must succeed before this one may start.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Resources (file paths) the task intends to modify.
    #[serde(default, alias = "files_to_modify")]
    pub resources: Vec<String>,
    /// Prompt handed to the agent; the description is used when empty.
    #[serde(default)]
    pub prompt: String,
    /// Tool names the agent may use; empty means the agent profile decides.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, description: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            agent_type: default_agent_type(),
            dependencies: Vec::new(),
            resources: Vec::new(),
            prompt: String::new(),
            tools: Vec::new(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn touches(mut self, resource: &str) -> Self {
        self.resources.push(resource.to_string());
        self
    }

    pub fn with_agent_type(mut self, agent_type: &str) -> Self {
        self.agent_type = agent_type.to_string();
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }

    /// The prompt to send, falling back to the description.
    pub fn effective_prompt(&self) -> &str {
        if self.prompt.trim().is_empty() {
            &self.description
        } else {
            &self.prompt
        }
    }
}

/// A task carried through a run: its declaration plus lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// The declaration from the plan.
    pub spec: TaskSpec,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Cost reported by the agent, summed over every attempt.
    pub cost_usd: f64,
    /// Success output, once succeeded.
    pub output: Option<String>,
    /// Number of agent invocations used.
    pub attempts: u32,
    /// Agent that executed the task.
    pub agent_id: Option<AgentId>,
    /// When the task was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            status: TaskStatus::Pending,
            cost_usd: 0.0,
            output: None,
            attempts: 0,
            agent_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.spec.id
    }

    /// Transition `pending -> ready`.
    pub fn mark_ready(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Ready;
        }
    }

    /// Transition `ready -> running`.
    pub fn start(&mut self, agent_id: AgentId) {
        self.status = TaskStatus::Running;
        self.agent_id = Some(agent_id);
        self.started_at = Some(Utc::now());
    }

    /// Transition `running -> succeeded`.
    pub fn succeed(&mut self, output: String, cost_usd: f64, attempts: u32) {
        self.status = TaskStatus::Succeeded;
        self.output = Some(output);
        self.record_finish(cost_usd, attempts);
    }

    /// Transition `running -> failed`. Cost already incurred is kept.
    pub fn fail(&mut self, error: &str, cost_usd: f64, attempts: u32) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.record_finish(cost_usd, attempts);
    }

    /// Transition `pending|ready -> skipped`.
    ///
    /// Returns `false` (and leaves the task alone) from any other state.
    pub fn skip(&mut self, reason: SkipReason) -> bool {
        if !self.can_skip() {
            return false;
        }
        self.status = TaskStatus::Skipped { reason };
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn can_skip(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn record_finish(&mut self, cost_usd: f64, attempts: u32) {
        self.cost_usd = cost_usd;
        self.attempts = attempts;
        self.completed_at = Some(Utc::now());
    }
}
