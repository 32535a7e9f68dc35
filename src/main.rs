use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use swarm::config::SwarmConfig;
use swarm::core::{Plan, PlanSpec, TaskStatus};
use swarm::orchestration::{
    AgentRunner, ClaudeRunner, EventRecorder, EventSink, NullSink, Orchestrator, QualityGate,
    QualityReport, RunConfig, RunResult, SimulatedRunner,
};
use swarm::Result;

/// Swarm - run a plan of dependent agent tasks in parallel
#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    SWARM_DEBUG=1     Enable debug logging (alternative to --debug)\n    SWARM_LOG=LEVEL   Log level (error, warn, info, debug, trace)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.swarm/swarm.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a plan until every task has finished
    Run(RunArgs),

    /// Validate a plan and print its waves without running anything
    Plan {
        /// Plan file (JSON)
        plan: PathBuf,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Plan file (JSON)
    pub plan: PathBuf,

    /// Maximum number of agents running at once
    #[arg(long = "max-agents")]
    pub max_agents: Option<usize>,

    /// Budget ceiling in USD
    #[arg(long)]
    pub budget: Option<f64>,

    /// Config file (default: swarm.toml, .swarm/swarm.toml or .claude/swarm.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Attempts per task, retries included (1 = no retry)
    #[arg(long)]
    pub retry: Option<u32>,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Working directory for agents (default: current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Record run events as JSON lines to this file
    #[arg(long)]
    pub events: Option<PathBuf>,

    /// Use the simulated runner instead of the claude CLI
    #[arg(long)]
    pub demo: bool,

    /// Review the combined task outputs after the run (default)
    #[arg(long = "quality-gate", overrides_with = "no_quality_gate")]
    pub quality_gate: bool,

    /// Skip the post-run quality review
    #[arg(long = "no-quality-gate", overrides_with = "quality_gate")]
    pub no_quality_gate: bool,

    /// Print the run result as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Scheduling inputs from the config file with command-line overrides.
    fn run_config(&self, config: &SwarmConfig) -> RunConfig {
        let mut run_config = RunConfig::from_config(config);
        if let Some(max_agents) = self.max_agents {
            run_config.max_concurrent = max_agents;
        }
        if let Some(budget) = self.budget {
            run_config.budget_ceiling = budget;
        }
        if let Some(retry) = self.retry {
            run_config.max_attempts = retry;
        }
        if let Some(secs) = self.timeout {
            run_config.task_timeout = Some(Duration::from_secs(secs));
        }
        run_config
    }

    /// Whether to review the run afterwards: the flags win over
    /// `swarm.quality_gate`. The simulated runner is never reviewed.
    fn quality_gate_enabled(&self, config: &SwarmConfig) -> bool {
        if self.demo {
            return false;
        }
        if self.no_quality_gate {
            false
        } else {
            self.quality_gate || config.swarm.quality_gate
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on debug flag
    swarm::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Run(args) => run_plan(args),
        Command::Plan { plan } => show_plan(&plan),
    }
}

fn load_config(path: Option<&Path>, cwd: &Path) -> Result<SwarmConfig> {
    match path {
        Some(path) => SwarmConfig::from_file(path),
        None => Ok(SwarmConfig::find(cwd)?.unwrap_or_default()),
    }
}

fn run_plan(args: RunArgs) -> Result<()> {
    let cwd = match &args.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let config = load_config(args.config.as_deref(), &cwd)?;
    let run_config = args.run_config(&config);
    run_config.validate()?;

    let plan = Plan::from_spec(PlanSpec::from_file(&args.plan)?)?;
    let plan_prompt = plan.prompt().to_string();
    info!(plan = %args.plan.display(), tasks = plan.len(), demo = args.demo, "Run command");

    let gate = args
        .quality_gate_enabled(&config)
        .then(|| QualityGate::new(&config, &cwd));
    let runner: Arc<dyn AgentRunner> = if args.demo {
        Arc::new(SimulatedRunner::demo())
    } else {
        Arc::new(ClaudeRunner::new(config, &cwd)?)
    };
    let sink: Arc<dyn EventSink> = match &args.events {
        Some(path) => Arc::new(EventRecorder::create(path)?),
        None => Arc::new(NullSink),
    };

    if !args.json {
        println!("Running {} tasks (max {} agents)", plan.len(), run_config.max_concurrent);
        println!();
    }

    // Create async runtime for the orchestrator
    let rt = tokio::runtime::Runtime::new()?;
    let events = Arc::clone(&sink);
    let mut result = rt.block_on(async {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling run");
                interrupt.cancel();
            }
        });

        Orchestrator::new(plan, runner, run_config)
            .with_sink(sink)
            .run(cancel)
            .await
    })?;

    if let Some(gate) = gate.filter(|_| QualityGate::should_review(&result)) {
        if !args.json {
            println!("Reviewing results with {}...", gate.model());
        }
        match rt.block_on(gate.review(&plan_prompt, &result)) {
            Ok(report) => {
                events.emit(report.event());
                result.attach_quality(report);
            }
            Err(e) => {
                warn!(error = %e, "quality gate skipped");
                eprintln!("Quality gate skipped: {}", e);
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }
    Ok(())
}

fn show_plan(path: &Path) -> Result<()> {
    let plan = Plan::from_spec(PlanSpec::from_file(path)?)?;

    if !plan.prompt().is_empty() {
        println!("Plan: {}", plan.prompt());
    }
    println!("{} tasks", plan.len());
    println!();
    for (index, wave) in plan.stratify().iter().enumerate() {
        let ids: Vec<&str> = wave.iter().map(|id| id.as_str()).collect();
        println!("  Wave {}: {}", index + 1, ids.join(", "));
    }
    Ok(())
}

fn print_summary(result: &RunResult) {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                       Run Complete                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("  Stopped:     {}", result.stop_reason);
    println!(
        "  Tasks:       {} succeeded, {} failed, {} skipped",
        result.succeeded, result.failed, result.skipped
    );
    println!("  Cost:        ${:.4}", result.total_cost_usd);
    println!("  Duration:    {:.1}s", result.duration().as_secs_f64());
    println!();

    for task in &result.tasks {
        println!(
            "  {} {:<20} {:<40} ${:.4}",
            status_marker(&task.status),
            task.id.as_str(),
            format_status(&task.status),
            task.cost_usd
        );
    }

    if let Some(report) = &result.quality {
        println!();
        print_quality(report);
    }

    if !result.conflicts.is_empty() {
        println!();
        println!("  Resource conflicts:");
        for conflict in &result.conflicts {
            println!(
                "    • {} waited for {} (held by {})",
                conflict.waiting, conflict.resource, conflict.holder
            );
        }
    }
}

fn print_quality(report: &QualityReport) {
    println!(
        "  Quality:     {}/10, {} (review ${:.4})",
        report.overall_score, report.verdict, report.review_cost_usd
    );
    if !report.summary.is_empty() {
        println!("               {}", truncate_string(&report.summary, 60));
    }
    for review in report.task_reviews.iter().filter(|r| !r.issues.is_empty()) {
        println!("    {} ({}/10)", review.task_id, review.score);
        for issue in &review.issues {
            println!("      ! {}", issue);
        }
    }
    for issue in &report.integration_issues {
        println!("    ! {}", issue);
    }
    for item in &report.missing_items {
        println!("    - missing: {}", item);
    }
}

fn status_marker(status: &TaskStatus) -> &'static str {
    match status {
        TaskStatus::Succeeded => "✓",
        TaskStatus::Failed { .. } => "✗",
        TaskStatus::Skipped { .. } => "-",
        _ => "?",
    }
}

fn format_status(status: &TaskStatus) -> String {
    match status {
        TaskStatus::Failed { error } => format!("failed: {}", truncate_string(error, 32)),
        TaskStatus::Skipped { reason } => format!("skipped: {}", reason),
        other => other.label().to_string(),
    }
}

/// Truncate to `max_len` characters, adding "..." when cut.
fn truncate_string(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    if first_line.chars().count() <= max_len {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
