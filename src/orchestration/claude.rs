//! Claude Code headless runner.
//!
//! [`ClaudeRunner`] executes a task by running the agent CLI in headless
//! mode (`-p`) with JSON output, then maps the reported result and
//! `total_cost_usd` onto an [`AgentOutcome`].

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::agent::Agent;
use crate::config::SwarmConfig;
use crate::core::TaskSpec;
use crate::error::{Error, Result};
use crate::orchestration::runner::{AgentOutcome, AgentRunner};

/// Internal struct for deserializing the CLI's JSON result.
#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    total_cost_usd: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// Runs each task through the `claude` CLI in a working directory.
#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    config: SwarmConfig,
    cwd: PathBuf,
}

impl ClaudeRunner {
    /// Create a runner, checking that the configured binary is on PATH.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClaudeBinaryNotFound`] if the binary cannot be found.
    pub fn new(config: SwarmConfig, cwd: &Path) -> Result<Self> {
        if !Agent::from_config(&config, "coder").is_available() {
            return Err(Error::ClaudeBinaryNotFound);
        }
        Ok(Self::with_unchecked_binary(config, cwd))
    }

    /// Create a runner without looking the binary up first.
    pub fn with_unchecked_binary(config: SwarmConfig, cwd: &Path) -> Self {
        Self {
            config,
            cwd: cwd.to_path_buf(),
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Parse the CLI's JSON output into an outcome.
    pub fn parse_json_response(json_str: &str) -> Result<AgentOutcome> {
        let raw: RawClaudeResponse = serde_json::from_str(json_str.trim())?;
        let cost = raw.total_cost_usd.unwrap_or(0.0);

        let failed = raw.is_error
            || raw
                .subtype
                .as_deref()
                .is_some_and(|subtype| subtype.starts_with("error"));

        if failed || (raw.result.is_none() && raw.error.is_some()) {
            let message = raw
                .error
                .or(raw.result)
                .or(raw.subtype)
                .unwrap_or_else(|| "unknown error".to_string());
            return Ok(AgentOutcome::failed(message, cost));
        }

        match raw.result {
            Some(result) => Ok(AgentOutcome::succeeded(result, cost)),
            None => Ok(AgentOutcome::failed("Unknown response format", cost)),
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn execute(&self, task: &TaskSpec) -> Result<AgentOutcome> {
        let agent = Agent::from_config(&self.config, &task.agent_type);
        debug!(task = %task.id, agent_type = agent.agent_type(), model = agent.model(), "spawning agent");
        run_headless(agent.binary(), agent.args(task), &self.cwd).await
    }
}

/// Run the agent CLI once and map its output onto an [`AgentOutcome`].
///
/// JSON output wins over the exit status, so a failed run still reports
/// its cost. Dropping the future kills the child process.
pub(crate) async fn run_headless(
    binary: &str,
    args: Vec<String>,
    cwd: &Path,
) -> Result<AgentOutcome> {
    let output = Command::new(binary)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Ok(outcome) = ClaudeRunner::parse_json_response(&stdout) {
        return Ok(outcome);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!(
                "agent exited with code {}",
                output.status.code().unwrap_or(-1)
            )
        } else {
            stderr.trim().to_string()
        };
        return Ok(AgentOutcome::failed(message, 0.0));
    }

    // Non-JSON success output; no cost information available.
    Ok(AgentOutcome::succeeded(stdout.trim(), 0.0))
}
