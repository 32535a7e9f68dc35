//! The orchestration control loop.
//!
//! The [`Orchestrator`] is the only owner of run state: the [`Plan`] and its
//! task states, the [`ResourceLockTable`] and the [`BudgetMeter`]. Each
//! dispatched task runs on its own tokio task and reports back over a
//! channel; the loop integrates those reports one at a time, so none of the
//! run state needs its own synchronisation.

use crate::agent::AgentId;
use crate::config::SwarmConfig;
use crate::core::{Plan, SkipReason, Task, TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::budget::BudgetMeter;
use crate::orchestration::events::{EventSink, NullSink, RunEvent};
use crate::orchestration::locks::{LockOutcome, ResourceLockTable};
use crate::orchestration::quality::QualityReport;
use crate::orchestration::runner::{AgentOutcome, AgentRunner, OutcomeStatus};
use crate::util::{spawn_guarded, with_timeout};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scheduling inputs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Maximum number of tasks running at once.
    pub max_concurrent: usize,
    /// Spend in USD at which dispatching stops.
    pub budget_ceiling: f64,
    /// Limit for a single agent invocation.
    pub task_timeout: Option<Duration>,
    /// Agent invocations allowed per dispatched task.
    pub max_attempts: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            budget_ceiling: 5.0,
            task_timeout: None,
            max_attempts: 1,
        }
    }
}

impl RunConfig {
    /// No budget ceiling, no timeout, no retries.
    pub fn unlimited(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            budget_ceiling: f64::INFINITY,
            ..Self::default()
        }
    }

    pub fn from_config(config: &SwarmConfig) -> Self {
        Self {
            max_concurrent: config.swarm.max_concurrent,
            budget_ceiling: config.swarm.budget_usd,
            task_timeout: config.swarm.task_timeout_secs.map(Duration::from_secs),
            max_attempts: config.swarm.max_attempts,
        }
    }

    pub fn with_budget(mut self, budget_ceiling: f64) -> Self {
        self.budget_ceiling = budget_ceiling;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        // Rejects NaN as well as non-positive amounts.
        if !(self.budget_ceiling > 0.0) {
            return Err(Error::InvalidConfig(
                "budget ceiling must be a positive amount".to_string(),
            ));
        }
        if self.task_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidConfig(
                "task timeout must be positive".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every task reached a terminal state without a run-level stop.
    Completed,
    /// Spend reached the ceiling; undispatched tasks were skipped.
    BudgetExceeded,
    /// The cancel signal fired; undispatched tasks were skipped.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::BudgetExceeded => write!(f, "budget exceeded"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A lock conflict observed during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConflict {
    pub resource: String,
    pub holder: TaskId,
    pub waiting: TaskId,
}

/// Terminal state of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub description: String,
    pub agent_type: String,
    pub status: TaskStatus,
    pub cost_usd: f64,
    pub attempts: u32,
    #[serde(default)]
    pub resources: Vec<String>,
    pub agent_id: Option<AgentId>,
    pub output: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskReport {
    fn from(task: Task) -> Self {
        Self {
            id: task.spec.id,
            description: task.spec.description,
            agent_type: task.spec.agent_type,
            status: task.status,
            cost_usd: task.cost_usd,
            attempts: task.attempts,
            resources: task.spec.resources,
            agent_id: task.agent_id,
            output: task.output,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub stop_reason: StopReason,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_cost_usd: f64,
    pub duration_ms: u64,
    /// Stratification of the plan that was run.
    pub waves: Vec<Vec<TaskId>>,
    /// Task ids in the order they were dispatched.
    pub dispatch_order: Vec<TaskId>,
    /// Every task, in declaration order.
    pub tasks: Vec<TaskReport>,
    pub conflicts: Vec<ResourceConflict>,
    /// Post-run review, when one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
}

impl RunResult {
    pub fn task(&self, id: &TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<&TaskStatus> {
        self.task(&TaskId::from(id)).map(|t| &t.status)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// True when every task succeeded.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Record a quality review; its cost joins the run total.
    pub fn attach_quality(&mut self, report: QualityReport) {
        if report.review_cost_usd.is_finite() && report.review_cost_usd > 0.0 {
            self.total_cost_usd += report.review_cost_usd;
        }
        self.quality = Some(report);
    }
}

/// Messages from in-flight executions to the control loop.
#[derive(Debug)]
enum ExecutionEvent {
    /// An attempt failed and another is allowed. The execution waits on
    /// `resume` so the loop can book `cost_usd` and stop the run first.
    Retrying {
        task_id: TaskId,
        attempt: u32,
        error: String,
        cost_usd: f64,
        resume: oneshot::Sender<()>,
    },
    Finished {
        task_id: TaskId,
        outcome: AgentOutcome,
        attempts: u32,
    },
}

/// Drives a [`Plan`] to completion.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use swarm::core::Plan;
/// use swarm::orchestration::{Orchestrator, RunConfig, Script, SimulatedRunner};
///
/// let plan = Plan::from_spec(spec)?;
/// let runner = Arc::new(SimulatedRunner::new(Script::succeed(0.1)));
/// let result = Orchestrator::new(plan, runner, RunConfig::default())
///     .run(CancellationToken::new())
///     .await?;
/// ```
pub struct Orchestrator {
    plan: Plan,
    config: RunConfig,
    runner: Arc<dyn AgentRunner>,
    sink: Arc<dyn EventSink>,
    locks: ResourceLockTable,
    budget: BudgetMeter,
    /// Running tasks and the agent executing each.
    in_flight: HashMap<TaskId, AgentId>,
    dispatch_order: Vec<TaskId>,
    conflicts: Vec<ResourceConflict>,
    seen_conflicts: HashSet<(TaskId, String)>,
    /// Spend already booked for running tasks by their failed attempts.
    booked: HashMap<TaskId, f64>,
    stop_reason: Option<StopReason>,
    /// Child of the run's cancel token, also fired by [`Self::stop`].
    /// Executions check it before every retry.
    halt: CancellationToken,
}

impl Orchestrator {
    pub fn new(plan: Plan, runner: Arc<dyn AgentRunner>, config: RunConfig) -> Self {
        let budget = BudgetMeter::new(config.budget_ceiling);
        Self {
            plan,
            config,
            runner,
            sink: Arc::new(NullSink),
            locks: ResourceLockTable::new(),
            budget,
            in_flight: HashMap::new(),
            dispatch_order: Vec::new(),
            conflicts: Vec::new(),
            seen_conflicts: HashSet::new(),
            booked: HashMap::new(),
            stop_reason: None,
            halt: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Run the plan until every task is terminal.
    ///
    /// Each iteration stops the run if `cancel` fired or the budget is
    /// exceeded, dispatches ready tasks while slots and locks allow, then
    /// waits for at least one in-flight task to report.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unusable [`RunConfig`].
    /// Task failures are not errors; they are reported in the result.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunResult> {
        self.config.validate()?;
        self.halt = cancel.child_token();
        let started = Instant::now();
        let waves = self.plan.stratify();

        info!(
            tasks = self.plan.len(),
            waves = waves.len(),
            max_concurrent = self.config.max_concurrent,
            budget = self.config.budget_ceiling,
            "run started"
        );
        self.sink.emit(RunEvent::RunStarted {
            tasks: self.plan.len(),
            waves: waves.len(),
            max_concurrent: self.config.max_concurrent,
            budget_ceiling: self
                .config
                .budget_ceiling
                .is_finite()
                .then_some(self.config.budget_ceiling),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<ExecutionEvent>();
        self.promote_ready();

        loop {
            if self.plan.is_finished() {
                break;
            }

            self.check_stop();
            if self.stop_reason.is_none() {
                self.dispatch_ready(&tx);
            }

            if self.in_flight.is_empty() {
                if self.plan.is_finished() {
                    break;
                }
                return Err(Error::Stalled {
                    remaining: self.plan.unfinished_count(),
                });
            }

            let event = tokio::select! {
                biased;
                event = rx.recv() => event,
                _ = self.halt.cancelled(), if self.stop_reason.is_none() => continue,
            };
            // The loop holds a sender, so the channel cannot close here.
            let Some(event) = event else {
                break;
            };
            self.integrate(event);
            while let Ok(event) = rx.try_recv() {
                self.integrate(event);
            }
        }

        Ok(self.finish(waves, started.elapsed()))
    }

    /// Dispatch ready tasks in declaration order while slots remain.
    fn dispatch_ready(&mut self, tx: &mpsc::UnboundedSender<ExecutionEvent>) {
        for task_id in self.plan.ready_set() {
            if self.in_flight.len() >= self.config.max_concurrent {
                break;
            }
            let Some(task) = self.plan.get_task(&task_id) else {
                continue;
            };
            match self.locks.acquire(&task_id, &task.spec.resources) {
                LockOutcome::Granted => self.dispatch(task_id, tx),
                LockOutcome::Conflict { holder, resource } => {
                    debug!(task = %task_id, %holder, %resource, "resource busy, task stays ready");
                    self.record_conflict(task_id, holder, resource);
                }
            }
        }
    }

    fn dispatch(&mut self, task_id: TaskId, tx: &mpsc::UnboundedSender<ExecutionEvent>) {
        let agent_id = AgentId::new();
        let Some(task) = self.plan.get_task_mut(&task_id) else {
            return;
        };
        task.start(agent_id);
        let spec = task.spec.clone();

        info!(task = %task_id, agent = %agent_id, "task started");
        self.in_flight.insert(task_id.clone(), agent_id);
        self.dispatch_order.push(task_id.clone());
        self.sink.emit(RunEvent::TaskStarted { task_id, agent_id });

        let runner = Arc::clone(&self.runner);
        let tx = tx.clone();
        let timeout = self.config.task_timeout;
        let max_attempts = self.config.max_attempts;
        let halt = self.halt.clone();
        tokio::spawn(async move {
            let event = execute(runner, spec, timeout, max_attempts, halt, &tx).await;
            let _ = tx.send(event);
        });
    }

    /// Stop the run if the cancel token fired or the budget ran out.
    fn check_stop(&mut self) {
        if self.stop_reason.is_some() || self.plan.is_finished() {
            return;
        }
        if self.halt.is_cancelled() {
            self.stop(StopReason::Cancelled);
        } else if self.budget.is_exceeded() {
            self.stop(StopReason::BudgetExceeded);
        }
    }

    fn integrate(&mut self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Retrying {
                task_id,
                attempt,
                error,
                cost_usd,
                resume,
            } => {
                warn!(task = %task_id, attempt, cost = cost_usd, %error, "attempt failed");
                self.book_spend(&task_id, cost_usd);
                self.sink.emit(RunEvent::TaskRetrying {
                    task_id,
                    attempt,
                    error,
                    cost_usd,
                });
                self.check_stop();
                let _ = resume.send(());
            }
            ExecutionEvent::Finished {
                task_id,
                outcome,
                attempts,
            } => {
                self.complete(task_id, outcome, attempts);
                self.check_stop();
            }
        }
    }

    /// Record the cost of a failed attempt while its task is still running.
    fn book_spend(&mut self, task_id: &TaskId, cost_usd: f64) {
        if !(cost_usd.is_finite() && cost_usd > 0.0) {
            return;
        }
        self.budget.record_spend(cost_usd);
        *self.booked.entry(task_id.clone()).or_insert(0.0) += cost_usd;
    }

    fn complete(&mut self, task_id: TaskId, outcome: AgentOutcome, attempts: u32) {
        if self.in_flight.remove(&task_id).is_none() {
            warn!(task = %task_id, "completion for a task that is not running");
            return;
        }
        let freed = self.locks.release(&task_id);
        let booked = self.booked.remove(&task_id).unwrap_or(0.0);
        self.budget.record_spend((outcome.cost_usd - booked).max(0.0));

        let Some(task) = self.plan.get_task_mut(&task_id) else {
            return;
        };
        match &outcome.status {
            OutcomeStatus::Succeeded => {
                info!(task = %task_id, cost = outcome.cost_usd, attempts, "task succeeded");
                task.succeed(outcome.output.clone(), outcome.cost_usd, attempts);
            }
            OutcomeStatus::Failed { error } => {
                warn!(task = %task_id, cost = outcome.cost_usd, attempts, %error, "task failed");
                task.fail(error, outcome.cost_usd, attempts);
            }
        }
        if !freed.is_empty() {
            debug!(task = %task_id, resources = ?freed, "locks released");
        }

        self.sink.emit(RunEvent::TaskCompleted {
            task_id: task_id.clone(),
            outcome: outcome.status.clone(),
            cost_usd: outcome.cost_usd,
            attempts,
        });

        if !outcome.is_success() {
            for skipped in self.plan.skip_downstream(&task_id) {
                info!(task = %skipped, failed = %task_id, "task skipped");
                self.sink.emit(RunEvent::TaskSkipped {
                    task_id: skipped,
                    reason: SkipReason::DependencyFailed {
                        task: task_id.clone(),
                    },
                });
            }
        }

        self.promote_ready();
    }

    fn promote_ready(&mut self) {
        for task_id in self.plan.promote_ready() {
            debug!(task = %task_id, "task ready");
            self.sink.emit(RunEvent::TaskReady { task_id });
        }
    }

    /// Stop dispatching, skip every task that has not started and tell
    /// running executions not to retry.
    fn stop(&mut self, reason: StopReason) {
        self.stop_reason = Some(reason);
        self.halt.cancel();
        let skip_reason = match reason {
            StopReason::BudgetExceeded => {
                warn!(
                    spent = self.budget.spent(),
                    ceiling = self.budget.ceiling(),
                    "budget exceeded, no further tasks will be dispatched"
                );
                self.sink.emit(RunEvent::BudgetExceeded {
                    spent: self.budget.spent(),
                    ceiling: self.budget.ceiling(),
                });
                SkipReason::BudgetExceeded
            }
            StopReason::Cancelled => {
                info!(running = self.in_flight.len(), "run cancelled, waiting for running tasks");
                SkipReason::Cancelled
            }
            StopReason::Completed => return,
        };

        for task_id in self.plan.skip_unstarted(skip_reason.clone()) {
            self.sink.emit(RunEvent::TaskSkipped {
                task_id,
                reason: skip_reason.clone(),
            });
        }
    }

    fn record_conflict(&mut self, waiting: TaskId, holder: TaskId, resource: String) {
        if !self.seen_conflicts.insert((waiting.clone(), resource.clone())) {
            return;
        }
        self.sink.emit(RunEvent::ResourceConflict {
            resource: resource.clone(),
            holder: holder.clone(),
            waiting: waiting.clone(),
        });
        self.conflicts.push(ResourceConflict {
            resource,
            holder,
            waiting,
        });
    }

    fn finish(self, waves: Vec<Vec<TaskId>>, elapsed: Duration) -> RunResult {
        let stop_reason = self.stop_reason.unwrap_or(StopReason::Completed);
        let succeeded = self.plan.count_with_label("succeeded");
        let failed = self.plan.count_with_label("failed");
        let skipped = self.plan.count_with_label("skipped");
        let total_cost_usd = self.budget.spent();

        info!(
            %stop_reason,
            succeeded,
            failed,
            skipped,
            cost = total_cost_usd,
            "run finished"
        );
        self.sink.emit(RunEvent::RunFinished {
            stop_reason,
            succeeded,
            failed,
            skipped,
            total_cost_usd,
        });

        RunResult {
            stop_reason,
            succeeded,
            failed,
            skipped,
            total_cost_usd,
            duration_ms: elapsed.as_millis() as u64,
            waves,
            dispatch_order: self.dispatch_order,
            tasks: self.plan.into_tasks().into_iter().map(TaskReport::from).collect(),
            conflicts: self.conflicts,
            quality: None,
        }
    }
}

/// Run `plan` to completion with the given runner.
pub async fn run(
    plan: Plan,
    runner: Arc<dyn AgentRunner>,
    config: RunConfig,
    cancel: CancellationToken,
) -> Result<RunResult> {
    Orchestrator::new(plan, runner, config).run(cancel).await
}

/// Execute one dispatched task, retrying failed attempts up to `max_attempts`.
///
/// Each attempt runs on its own tokio task under the timeout, so a panic or
/// an overrun is reported as a failed attempt. The returned event carries
/// the cost summed over every attempt. No retry starts once `halt` fired.
async fn execute(
    runner: Arc<dyn AgentRunner>,
    spec: TaskSpec,
    timeout: Option<Duration>,
    max_attempts: u32,
    halt: CancellationToken,
    tx: &mpsc::UnboundedSender<ExecutionEvent>,
) -> ExecutionEvent {
    let max_attempts = max_attempts.max(1);
    let mut cost_usd = 0.0;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let runner = Arc::clone(&runner);
        let task = spec.clone();
        let result =
            spawn_guarded(async move { with_timeout(timeout, runner.execute(&task)).await }).await;

        let mut attempt_cost = 0.0;
        let error = match result {
            Ok(outcome) => {
                if outcome.cost_usd.is_finite() && outcome.cost_usd > 0.0 {
                    attempt_cost = outcome.cost_usd;
                    cost_usd += attempt_cost;
                }
                match outcome.status {
                    OutcomeStatus::Succeeded => {
                        return ExecutionEvent::Finished {
                            task_id: spec.id,
                            outcome: AgentOutcome::succeeded(outcome.output, cost_usd),
                            attempts: attempt,
                        };
                    }
                    OutcomeStatus::Failed { error } => error,
                }
            }
            Err(Error::Timeout(limit)) => format!("timed out after {:?}", limit),
            Err(Error::TaskJoin(detail)) => format!("agent crashed: {}", detail),
            Err(e) => e.to_string(),
        };

        if attempt >= max_attempts {
            return ExecutionEvent::Finished {
                task_id: spec.id,
                outcome: AgentOutcome::failed(error, cost_usd),
                attempts: attempt,
            };
        }
        let (resume, resumed) = oneshot::channel();
        let sent = tx.send(ExecutionEvent::Retrying {
            task_id: spec.id.clone(),
            attempt,
            error: error.clone(),
            cost_usd: attempt_cost,
            resume,
        });
        if sent.is_ok() {
            let _ = resumed.await;
        }
        if halt.is_cancelled() {
            return ExecutionEvent::Finished {
                task_id: spec.id,
                outcome: AgentOutcome::failed(
                    format!("run stopped before retry: {}", error),
                    cost_usd,
                ),
                attempts: attempt,
            };
        }
    }
}
