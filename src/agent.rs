use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SwarmConfig;
use crate::core::TaskSpec;

/// Identifier of one agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent-{}", self.short())
    }
}

/// An agent type resolved against the configuration: the command to run,
/// the model, the tools it may use, its prompt template and its run limits.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    agent_type: String,
    base_command: Vec<String>,
    model: String,
    tools: Vec<String>,
    prompt_template: String,
    permission_mode: String,
    max_turns: u32,
}

impl Agent {
    pub fn from_config(config: &SwarmConfig, agent_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            base_command: config
                .effective_command()
                .split_whitespace()
                .map(String::from)
                .collect(),
            model: config.agent_model(agent_type).to_string(),
            tools: config.agent_tools(agent_type),
            prompt_template: config.agent_prompt(agent_type).to_string(),
            permission_mode: config.agent_permission_mode(agent_type).to_string(),
            max_turns: config.agent_max_turns(agent_type),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_permission_mode(mut self, mode: impl Into<String>) -> Self {
        self.permission_mode = mode.into();
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn permission_mode(&self) -> &str {
        &self.permission_mode
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    /// Tools for a task: the task's own list wins over the profile's.
    pub fn tools_for<'a>(&'a self, task: &'a TaskSpec) -> &'a [String] {
        if task.tools.is_empty() {
            &self.tools
        } else {
            &task.tools
        }
    }

    /// Full prompt for a task: the profile template, then the task prompt.
    pub fn prompt_for(&self, task: &TaskSpec) -> String {
        let template = self.prompt_template.trim();
        if template.is_empty() {
            task.effective_prompt().to_string()
        } else {
            format!("{}\n\n{}", template, task.effective_prompt())
        }
    }

    /// Arguments after the binary for a headless run of `task`.
    pub fn args(&self, task: &TaskSpec) -> Vec<String> {
        self.headless_args(&self.prompt_for(task), self.tools_for(task))
    }

    /// Arguments after the binary for a headless run of a raw prompt.
    pub fn prompt_args(&self, prompt: &str) -> Vec<String> {
        self.headless_args(prompt, &self.tools)
    }

    fn headless_args(&self, prompt: &str, tools: &[String]) -> Vec<String> {
        let mut args: Vec<String> = self.base_command.iter().skip(1).cloned().collect();
        args.push("-p".to_string());
        args.push(prompt.to_string());
        args.push("--output-format".to_string());
        args.push("json".to_string());
        args.push("--model".to_string());
        args.push(self.model.clone());
        args.push("--permission-mode".to_string());
        args.push(self.permission_mode.clone());
        args.push("--max-turns".to_string());
        args.push(self.max_turns.to_string());
        if !tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
        args
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::from_config(&SwarmConfig::default(), "coder")
    }
}
