//! Post-run quality review.
//!
//! Once a run completes, [`QualityGate`] hands the plan prompt and every
//! task's outcome to a strong model in one headless call and parses its
//! answer into a [`QualityReport`]. The review never changes task states;
//! its cost is added to the run total by [`RunResult::attach_quality`].

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::Agent;
use crate::config::SwarmConfig;
use crate::core::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::claude::run_headless;
use crate::orchestration::events::RunEvent;
use crate::orchestration::runner::OutcomeStatus;
use crate::orchestration::scheduler::{RunResult, StopReason, TaskReport};
use crate::util::with_timeout;

/// Task output beyond this many characters is cut from the review prompt.
const MAX_OUTPUT_CHARS: usize = 2000;

/// The reviewer answers; it does not edit.
const REVIEW_PERMISSION_MODE: &str = "default";
const REVIEW_MAX_TURNS: u32 = 2;

/// Score given when the reviewer's answer holds no usable JSON.
const FALLBACK_SCORE: u8 = 7;

/// Overall judgement of a run's combined output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    Pass,
    NeedsRevision,
    Fail,
}

impl Verdict {
    /// Lenient parse of a reviewer's verdict; anything unrecognised passes.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "fail" | "failed" => Verdict::Fail,
            "needs_revision" | "revise" => Verdict::NeedsRevision,
            _ => Verdict::Pass,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::NeedsRevision => "needs_revision",
            Verdict::Fail => "fail",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Verdict {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Verdict::parse(&raw))
    }
}

/// The reviewer's notes on one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReview {
    pub task_id: TaskId,
    #[serde(default)]
    pub score: u8,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Parsed result of a quality review.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityReport {
    /// 1 to 10.
    pub overall_score: u8,
    pub verdict: Verdict,
    pub summary: String,
    pub task_reviews: Vec<TaskReview>,
    pub integration_issues: Vec<String>,
    pub missing_items: Vec<String>,
    pub review_cost_usd: f64,
}

impl QualityReport {
    /// Parse the reviewer's answer. Text without a parsable JSON object
    /// yields a passing report that says so in its summary.
    pub fn parse(text: &str, cost_usd: f64) -> Self {
        let Some(json) = extract_json(text) else {
            warn!("quality review returned no JSON object");
            return Self::fallback("no JSON object in the review", cost_usd);
        };
        match serde_json::from_str::<QualityReport>(json) {
            Ok(report) => Self {
                review_cost_usd: cost_usd,
                ..report
            },
            Err(e) => {
                warn!(error = %e, "quality review JSON did not parse");
                Self::fallback("review JSON did not parse", cost_usd)
            }
        }
    }

    fn fallback(reason: &str, cost_usd: f64) -> Self {
        Self {
            overall_score: FALLBACK_SCORE,
            verdict: Verdict::Pass,
            summary: format!("Quality review completed ({}), defaulting to pass", reason),
            review_cost_usd: cost_usd,
            ..Self::default()
        }
    }

    pub fn is_pass(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    pub fn review_of(&self, id: &TaskId) -> Option<&TaskReview> {
        self.task_reviews.iter().find(|r| &r.task_id == id)
    }

    /// Event recorded for this review.
    pub fn event(&self) -> RunEvent {
        RunEvent::QualityGate {
            overall_score: self.overall_score,
            verdict: self.verdict,
            summary: self.summary.clone(),
            review_cost_usd: self.review_cost_usd,
        }
    }
}

/// Reviews a finished run through the agent CLI.
#[derive(Debug, Clone)]
pub struct QualityGate {
    agent: Agent,
    cwd: PathBuf,
    timeout: Option<Duration>,
}

impl QualityGate {
    /// Reviewer using `swarm.model` with no tool allowlist, the default
    /// permission mode and two turns.
    pub fn new(config: &SwarmConfig, cwd: &Path) -> Self {
        let agent = Agent::from_config(config, "quality-gate")
            .with_model(config.swarm.model.as_str())
            .with_tools(Vec::new())
            .with_permission_mode(REVIEW_PERMISSION_MODE)
            .with_max_turns(REVIEW_MAX_TURNS);
        Self {
            agent,
            cwd: cwd.to_path_buf(),
            timeout: config.swarm.task_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.agent = self.agent.with_model(model);
        self
    }

    pub fn model(&self) -> &str {
        self.agent.model()
    }

    /// Only a completed run with at least one successful task is reviewed.
    pub fn should_review(result: &RunResult) -> bool {
        result.stop_reason == StopReason::Completed && result.succeeded > 0
    }

    /// # Errors
    ///
    /// Fails when the CLI cannot be run, reports an error or times out.
    pub async fn review(&self, plan_prompt: &str, result: &RunResult) -> Result<QualityReport> {
        let prompt = review_prompt(plan_prompt, &result.tasks);
        info!(model = self.agent.model(), tasks = result.tasks.len(), "quality review started");

        let outcome = with_timeout(
            self.timeout,
            run_headless(self.agent.binary(), self.agent.prompt_args(&prompt), &self.cwd),
        )
        .await?;

        match outcome.status {
            OutcomeStatus::Succeeded => {
                let report = QualityReport::parse(&outcome.output, outcome.cost_usd);
                info!(
                    score = report.overall_score,
                    verdict = %report.verdict,
                    cost = report.review_cost_usd,
                    "quality review finished"
                );
                Ok(report)
            }
            OutcomeStatus::Failed { error } => Err(Error::QualityReview(error)),
        }
    }
}

/// The reviewer's prompt: the plan prompt, one block per task and the
/// JSON shape expected back.
pub fn review_prompt(plan_prompt: &str, tasks: &[TaskReport]) -> String {
    let summaries: Vec<String> = tasks.iter().map(task_summary).collect();
    format!(
        r#"You are a senior software architect reviewing work done by a team of engineers. Each engineer completed one subtask on their own; judge the quality and coherence of the combined result.

ORIGINAL TASK:
{plan_prompt}

SUBTASK RESULTS:
{summaries}

Judge completeness (was the original task fully addressed), consistency (do the outputs fit together), correctness (bugs, logic errors, security issues) and maintainability.

Answer with JSON only, in this shape:
{{
  "overall_score": 1-10,
  "verdict": "pass" | "needs_revision" | "fail",
  "summary": "short overall assessment",
  "task_reviews": [
    {{"task_id": "...", "score": 1-10, "issues": ["..."], "suggestions": ["..."]}}
  ],
  "integration_issues": ["..."],
  "missing_items": ["..."]
}}"#,
        plan_prompt = plan_prompt.trim(),
        summaries = summaries.join("\n\n"),
    )
}

fn task_summary(task: &TaskReport) -> String {
    let resources = if task.resources.is_empty() {
        "none".to_string()
    } else {
        task.resources.join(", ")
    };
    let mut summary = format!(
        "--- Task: {} ({}) ---\nAgent type: {}\nDescription: {}\nResources: {}\nCost: ${:.4} | Attempts: {}",
        task.id,
        task.status.label().to_ascii_uppercase(),
        task.agent_type,
        task.description,
        resources,
        task.cost_usd,
        task.attempts,
    );
    if let Some(output) = task.output.as_deref().filter(|o| !o.trim().is_empty()) {
        summary.push_str("\nOutput:\n");
        if output.chars().count() > MAX_OUTPUT_CHARS {
            summary.extend(output.chars().take(MAX_OUTPUT_CHARS));
            summary.push_str("\n... (truncated)");
        } else {
            summary.push_str(output);
        }
    }
    match &task.status {
        TaskStatus::Failed { error } => summary.push_str(&format!("\nError: {}", error)),
        TaskStatus::Skipped { reason } => summary.push_str(&format!("\nSkipped: {}", reason)),
        _ => {}
    }
    summary
}

/// The JSON object in a reviewer's answer: a fenced ```json block if
/// present, otherwise the first balanced `{...}`.
fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            let block = body[..end].trim();
            if block.starts_with('{') {
                return Some(block);
            }
        }
    }

    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
