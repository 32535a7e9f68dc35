//! Typed swarm configuration.
//!
//! Configuration is read from TOML and validated when loaded. Every table
//! rejects unknown fields, so a typo fails loudly instead of being ignored.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

/// Project-relative locations searched by [`SwarmConfig::find`], in order.
pub const CONFIG_SEARCH_PATHS: &[&str] = &["swarm.toml", ".swarm/swarm.toml", ".claude/swarm.toml"];

pub const DEFAULT_AGENT_MODEL: &str = "haiku";
pub const DEFAULT_AGENT_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Grep", "Glob"];
/// Agents edit files without stopping at permission prompts.
pub const DEFAULT_PERMISSION_MODE: &str = "acceptEdits";
pub const DEFAULT_MAX_TURNS: u32 = 20;

fn default_name() -> String {
    "default".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_budget_usd() -> f64 {
    5.0
}

fn default_model() -> String {
    "opus".to_string()
}

fn default_max_attempts() -> u32 {
    1
}

fn default_permission_mode() -> String {
    DEFAULT_PERMISSION_MODE.to_string()
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

fn default_quality_gate() -> bool {
    true
}

fn default_agent_model() -> String {
    DEFAULT_AGENT_MODEL.to_string()
}

fn default_agent_tools() -> Vec<String> {
    DEFAULT_AGENT_TOOLS.iter().map(|t| t.to_string()).collect()
}

/// Run-wide settings (`[swarm]` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwarmSettings {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_budget_usd")]
    pub budget_usd: f64,
    /// Model used for plan decomposition and the post-run quality review.
    #[serde(default = "default_model")]
    pub model: String,
    pub task_timeout_secs: Option<u64>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Agent CLI command; defaults to `claude`.
    pub command: Option<String>,
    /// `--permission-mode` passed to every agent.
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    /// `--max-turns` passed to every agent.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Review the combined task outputs once the run completes.
    #[serde(default = "default_quality_gate")]
    pub quality_gate: bool,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_concurrent: default_max_concurrent(),
            budget_usd: default_budget_usd(),
            model: default_model(),
            task_timeout_secs: None,
            max_attempts: default_max_attempts(),
            command: None,
            permission_mode: default_permission_mode(),
            max_turns: default_max_turns(),
            quality_gate: default_quality_gate(),
        }
    }
}

/// A custom agent type (`[agents.<name>]` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentProfile {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_agent_model")]
    pub model: String,
    #[serde(default = "default_agent_tools")]
    pub tools: Vec<String>,
    /// Prompt template prepended to every task of this type.
    #[serde(default)]
    pub prompt: String,
    /// Overrides `swarm.permission_mode` for this agent type.
    pub permission_mode: Option<String>,
    /// Overrides `swarm.max_turns` for this agent type.
    pub max_turns: Option<u32>,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            description: String::new(),
            model: default_agent_model(),
            tools: default_agent_tools(),
            prompt: String::new(),
            permission_mode: None,
            max_turns: None,
        }
    }
}

/// One agent name or several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentNames {
    One(String),
    Many(Vec<String>),
}

impl AgentNames {
    pub fn names(&self) -> Vec<&str> {
        match self {
            AgentNames::One(name) => vec![name.as_str()],
            AgentNames::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Predecessor/successor edge between agent types (`[[connections]]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Connection {
    pub from: AgentNames,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SwarmConfig {
    #[serde(default)]
    pub swarm: SwarmSettings,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentProfile>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl SwarmConfig {
    pub fn swarm_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".swarm"))
            .ok_or_else(|| Error::InvalidConfig("no home directory".to_string()))
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading swarm config");
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Look for a config file under `cwd`; `Ok(None)` when there is none.
    pub fn find(cwd: &Path) -> Result<Option<Self>> {
        for relative in CONFIG_SEARCH_PATHS {
            let path = cwd.join(relative);
            if path.is_file() {
                return Self::from_file(&path).map(Some);
            }
        }
        debug!(cwd = %cwd.display(), "no swarm config found, using defaults");
        Ok(None)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.swarm;
        if s.max_concurrent == 0 {
            return Err(invalid("swarm.max_concurrent must be at least 1"));
        }
        if !(s.budget_usd.is_finite() && s.budget_usd > 0.0) {
            return Err(invalid("swarm.budget_usd must be a positive amount"));
        }
        if s.task_timeout_secs == Some(0) {
            return Err(invalid("swarm.task_timeout_secs must be positive"));
        }
        if s.max_attempts == 0 {
            return Err(invalid("swarm.max_attempts must be at least 1"));
        }
        if s.max_turns == 0 {
            return Err(invalid("swarm.max_turns must be at least 1"));
        }
        if s.permission_mode.trim().is_empty() {
            return Err(invalid("swarm.permission_mode must not be empty"));
        }
        for (name, profile) in &self.agents {
            if profile.max_turns == Some(0) {
                return Err(invalid(&format!("agents.{}.max_turns must be at least 1", name)));
            }
            if profile
                .permission_mode
                .as_deref()
                .is_some_and(|mode| mode.trim().is_empty())
            {
                return Err(invalid(&format!("agents.{}.permission_mode must not be empty", name)));
            }
        }

        let mut graph = DiGraph::<&str, ()>::new();
        let mut nodes = HashMap::new();
        for name in self.agents.keys() {
            nodes.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for conn in &self.connections {
            if conn.to.trim().is_empty() {
                return Err(invalid("connection target must not be empty"));
            }
            let to = *nodes
                .get(conn.to.as_str())
                .ok_or_else(|| invalid(&format!("connection targets unknown agent '{}'", conn.to)))?;
            let from_names = conn.from.names();
            if from_names.is_empty() {
                return Err(invalid(&format!("connection to '{}' has no source", conn.to)));
            }
            for from in from_names {
                let from = *nodes
                    .get(from)
                    .ok_or_else(|| invalid(&format!("connection from unknown agent '{}'", from)))?;
                graph.update_edge(from, to, ());
            }
        }
        if is_cyclic_directed(&graph) {
            return Err(invalid("agent connections form a cycle"));
        }
        Ok(())
    }

    pub fn agent_model(&self, agent_type: &str) -> &str {
        self.agents
            .get(agent_type)
            .map(|a| a.model.as_str())
            .unwrap_or(DEFAULT_AGENT_MODEL)
    }

    pub fn agent_tools(&self, agent_type: &str) -> Vec<String> {
        self.agents
            .get(agent_type)
            .map(|a| a.tools.clone())
            .unwrap_or_else(default_agent_tools)
    }

    pub fn agent_prompt(&self, agent_type: &str) -> &str {
        self.agents
            .get(agent_type)
            .map(|a| a.prompt.as_str())
            .unwrap_or("")
    }

    /// Permission mode for an agent type, falling back to `swarm.permission_mode`.
    pub fn agent_permission_mode(&self, agent_type: &str) -> &str {
        self.agents
            .get(agent_type)
            .and_then(|a| a.permission_mode.as_deref())
            .unwrap_or(&self.swarm.permission_mode)
    }

    pub fn agent_max_turns(&self, agent_type: &str) -> u32 {
        self.agents
            .get(agent_type)
            .and_then(|a| a.max_turns)
            .unwrap_or(self.swarm.max_turns)
    }

    /// Agent types that must precede `agent_type`, per `[[connections]]`.
    pub fn upstream_agents(&self, agent_type: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .connections
            .iter()
            .filter(|c| c.to == agent_type)
            .flat_map(|c| c.from.names())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn effective_command(&self) -> &str {
        self.swarm.command.as_deref().unwrap_or("claude")
    }
}

fn invalid(msg: &str) -> Error {
    Error::InvalidConfig(msg.to_string())
}
