use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use uuid::Uuid;

use memnexus::agent::DryRunAgent;
use memnexus::config::Config;
use memnexus::orchestration::{
    ExecutionPlan, InterventionId, InterventionPoint, InterventionSystem, OrchestratorEngine,
    PlanAnalysis, PlanReport, PlanRequest, ProgressEvent, ResolutionAction, Strategy,
};
use memnexus::Result;

/// MemNexus - multi-agent task orchestrator
#[derive(Parser, Debug)]
#[command(name = "memnexus")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MEMNEXUS_DEBUG=1      Enable debug logging (alternative to --debug)\n    MEMNEXUS_DATA_DIR     Data directory (default ~/.memnexus)")]
pub struct Cli {
    /// Enable debug logging (writes to <data dir>/memnexus.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default <data dir>/memnexus.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Analyze a plan file: phases, critical path, bottlenecks
    Plan {
        /// Task file (.toml or .json)
        file: PathBuf,

        /// Override the file's strategy (sequential, parallel, review, auto)
        #[arg(long, short = 's')]
        strategy: Option<Strategy>,

        /// Print the analysis as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute a plan file with the dry-run agent
    Run {
        /// Task file (.toml or .json)
        file: PathBuf,

        /// Override the file's strategy (sequential, parallel, review, auto)
        #[arg(long, short = 's')]
        strategy: Option<Strategy>,

        /// Approve every intervention without asking
        #[arg(long, short = 't')]
        trust: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    memnexus::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Plan {
            file,
            strategy,
            json,
        } => run_plan(&config, &file, strategy, json),
        Command::Run {
            file,
            strategy,
            trust,
        } => run_execute(&config, &file, strategy, trust),
    }
}

fn build_plan(config: &Config, file: &Path, strategy: Option<Strategy>) -> Result<ExecutionPlan> {
    let mut request = PlanRequest::load(file)?;
    if strategy.is_some() {
        request.strategy = strategy;
    }
    let session_id = Uuid::new_v4().to_string();
    tracing::info!(file = %file.display(), session = %session_id, "building plan");
    config.scheduler().build_plan(request, &session_id)
}

fn run_plan(config: &Config, file: &Path, strategy: Option<Strategy>, json: bool) -> Result<()> {
    let plan = build_plan(config, file, strategy)?;
    let analysis = config.scheduler().analyze(&plan);

    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    } else {
        print_analysis(&analysis);
    }
    Ok(())
}

fn print_analysis(analysis: &PlanAnalysis) {
    println!(
        "Strategy: {} (requested {})",
        analysis.effective_strategy, analysis.strategy
    );
    println!();
    println!("Phases:");
    for (i, phase) in analysis.phases.iter().enumerate() {
        let tasks: Vec<String> = phase
            .iter()
            .map(|id| format!("{} (slack {})", id, analysis.slack.get(id).copied().unwrap_or(0)))
            .collect();
        println!("  {}: {}", i, tasks.join(", "));
    }
    println!();

    let path: Vec<&str> = analysis
        .critical_path
        .tasks
        .iter()
        .map(|id| id.as_str())
        .collect();
    println!(
        "Critical path: {} (length {})",
        path.join(" -> "),
        analysis.critical_path.length
    );
    println!("Estimated duration: {}", analysis.estimated_duration);
    println!(
        "Parallelization factor: {:.2}",
        analysis.parallelization_factor
    );

    if !analysis.bottlenecks.is_empty() {
        println!();
        println!("Bottlenecks:");
        for bottleneck in &analysis.bottlenecks {
            println!(
                "  {} [{}] blocks {} task(s)",
                bottleneck.task, bottleneck.role, bottleneck.dependents
            );
        }
    }

    if !analysis.suggestions.is_empty() {
        println!();
        println!("Suggestions:");
        for suggestion in &analysis.suggestions {
            println!("  - {}", suggestion.description);
        }
    }
}

fn run_execute(config: &Config, file: &Path, strategy: Option<Strategy>, trust: bool) -> Result<()> {
    let plan = build_plan(config, file, strategy)?;
    println!(
        "Running {} task(s) in {} phase(s), strategy {}",
        plan.task_count(),
        plan.phases.len(),
        plan.effective_strategy
    );

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let interventions = InterventionSystem::new();
        let engine = OrchestratorEngine::new(
            plan,
            Arc::new(DryRunAgent),
            interventions.clone(),
            config.engine_config(),
        );
        let handle = engine.handle();
        let mut events = engine.subscribe();

        let mut responder = Responder::new(interventions.clone(), trust);
        let printer = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        print_event(&event);
                        if let ProgressEvent::InterventionCreated {
                            intervention_id, ..
                        } = &event
                        {
                            responder.answer(*intervention_id);
                        }
                        if matches!(event, ProgressEvent::PlanFinished { .. }) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event printer lagged");
                        responder.sweep();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let cancel = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("Cancelling...");
                let _ = cancel.cancel();
            }
        });

        let report = engine.run().await;
        let _ = printer.await;
        interventions.close();
        report
    })?;

    print_report(&report);
    Ok(())
}

/// Settles interventions from the terminal, or approves them outright when
/// trusted.
///
/// Prompts run one at a time on a dedicated thread fed by a queue, so events
/// keep flowing and two questions never share stdin.
struct Responder {
    system: InterventionSystem,
    trust: bool,
    asked: HashSet<InterventionId>,
    queue: Option<mpsc::UnboundedSender<InterventionId>>,
}

impl Responder {
    fn new(system: InterventionSystem, trust: bool) -> Self {
        let queue = (!trust).then(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let prompter = system.clone();
            // Detached so a pending stdin read never holds up shutdown.
            std::thread::spawn(move || prompt_loop(prompter, rx));
            tx
        });
        Self {
            system,
            trust,
            asked: HashSet::new(),
            queue,
        }
    }

    fn answer(&mut self, id: InterventionId) {
        if !self.asked.insert(id) {
            return;
        }
        if self.trust {
            if let Err(e) = self.system.resolve(id, ResolutionAction::Approve, "cli", Some("trusted")) {
                tracing::warn!(intervention = %id, error = %e, "auto-approve failed");
            }
            return;
        }
        if let Some(queue) = &self.queue {
            if queue.send(id).is_err() {
                tracing::warn!(intervention = %id, "prompt queue closed");
            }
        }
    }

    /// Pick up open points whose creation events were dropped.
    fn sweep(&mut self) {
        for point in self.system.pending_interventions() {
            self.answer(point.id);
        }
    }
}

fn prompt_loop(system: InterventionSystem, mut queue: mpsc::UnboundedReceiver<InterventionId>) {
    while let Some(id) = queue.blocking_recv() {
        let Some(point) = system.get(id) else {
            continue;
        };
        if point.is_terminal() {
            continue;
        }
        let action = ask(&point);
        if let Err(e) = system.resolve(id, action, "cli", None) {
            println!("  Could not resolve: {}", e);
        }
    }
}

fn ask(point: &InterventionPoint) -> ResolutionAction {
    println!();
    println!("[{}] {}", point.kind, point.title);
    if !point.description.is_empty() {
        println!("  {}", point.description);
    }

    if point.options.is_empty() {
        return match prompt_line("Approve? [y/N/m=modify] ").as_deref() {
            Some(line) if line.eq_ignore_ascii_case("y") => ResolutionAction::Approve,
            Some(line) if line.eq_ignore_ascii_case("m") => match prompt_line("Requested changes: ") {
                Some(changes) if !changes.is_empty() => {
                    let mut modifications = Map::new();
                    modifications.insert("changes".into(), Value::String(changes));
                    ResolutionAction::Modify { modifications }
                }
                _ => ResolutionAction::Reject,
            },
            _ => ResolutionAction::Reject,
        };
    }

    for (i, option) in point.options.iter().enumerate() {
        println!("  {}) {}", i + 1, option.label);
    }
    let choice = prompt_line("Choice: ")
        .and_then(|line| line.parse::<usize>().ok())
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| point.options.get(i));
    match choice {
        Some(option) => ResolutionAction::Select {
            option_id: option.id.clone(),
        },
        None => ResolutionAction::Reject,
    }
}

fn prompt_line(prompt: &str) -> Option<String> {
    print!("{}", prompt);
    io::stdout().flush().ok()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    Some(line.trim().to_string())
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::TaskStarted {
            task_id, role, agent_id, ..
        } => println!("  started   {} [{} {}]", task_id, role, agent_id.short()),
        ProgressEvent::TaskCompleted { task_id } => println!("  completed {}", task_id),
        ProgressEvent::TaskFailed { task_id, error } => println!("  failed    {}: {}", task_id, error),
        ProgressEvent::TaskSkipped { task_id, reason } => {
            println!("  skipped   {}: {}", task_id, reason)
        }
        ProgressEvent::InterventionResolved {
            task_id, status, ..
        } => println!("  {} intervention for {}", status, task_id),
        ProgressEvent::PlanPaused => println!("  paused"),
        ProgressEvent::PlanResumed => println!("  resumed"),
        ProgressEvent::ProgressUpdated { progress } => {
            tracing::debug!(fraction = progress.fraction, "progress");
        }
        _ => {}
    }
}

fn print_report(report: &PlanReport) {
    println!();
    println!("Plan {}: {}", report.session_id, report.status);
    println!(
        "  {} completed, {} failed, {} skipped of {}",
        report.progress.completed, report.progress.failed, report.progress.skipped, report.progress.total
    );
    if !report.waived.is_empty() {
        let waived: Vec<&str> = report.waived.iter().map(|id| id.as_str()).collect();
        println!("  waived: {}", waived.join(", "));
    }
}
