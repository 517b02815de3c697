use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use hive::agent::AgentCommand;
use hive::config::Config;
use hive::core::{BatchSummary, TaskBatch};
use hive::orchestration::{
    CommandBidSource, CommandExecutor, Coordinator, CoordinatorContext, CoordinatorOptions,
    EnvMetrics, EventSink, JsonlAuditLog, MetricRegistry, NegotiationEngine, RuleFile,
    ScaleDirection, ScalingEngine, Workspace,
};
use hive::{hlog, hlog_warn, Error, Result};

/// Hive - run task batches across a swarm of coding agents
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    HIVE_DEBUG=1                     Enable debug logging (alternative to --debug)\n    HIVE_LOG=<level>                 Log threshold: error, warn, info, debug or trace\n    HIVE_METRIC_<SOURCE>_<METRIC>    Metric values for scaling rules")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.hive/hive.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a batch of tasks
    Run(RunArgs),

    /// Evaluate scaling rules or scale a swarm by hand
    Scale {
        #[command(subcommand)]
        action: ScaleCommand,
    },
}

#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct RunArgs {
    /// Task batch file (JSON object with `tasks`, or a bare array)
    #[arg(long, conflicts_with = "task", required_unless_present = "task")]
    pub tasks: Option<PathBuf>,

    /// Run a single task described inline
    #[arg(long)]
    pub task: Option<String>,

    /// Scope hint for --task
    #[arg(long, requires = "task", conflicts_with = "tasks")]
    pub scope: Option<String>,

    /// Maximum tasks running at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Default per-task timeout in milliseconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Base branch for task branches
    #[arg(long)]
    pub branch: Option<String>,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub yolo: bool,

    /// Run every task in the current checkout instead of a worktree
    #[arg(long)]
    pub no_worktrees: bool,

    /// Scaling rule file evaluated alongside the run
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Seconds between scaling evaluations (requires rules)
    #[arg(long, default_value_t = 60)]
    pub scale_interval: u64,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ScaleCommand {
    /// Evaluate every scaling rule once
    Evaluate {
        /// Rule file (defaults to `rules` in hive.toml)
        #[arg(long)]
        rules: Option<PathBuf>,
    },
    /// Spawn agents of a swarm type
    Up {
        swarm_type: String,
        count: usize,
        /// Assignment for the new agents
        #[arg(long)]
        task: Option<String>,
    },
    /// Terminate agents of a swarm type
    Down { swarm_type: String, count: usize },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    hive::log::init(cli.debug);

    let config = Config::load()?;
    let code = match cli.command {
        Command::Run(args) => run_batch(args, &config)?,
        Command::Scale { action } => run_scale(action, &config)?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Effective run options: CLI flags, then the batch's session block, then config.
fn resolve_options(args: &RunArgs, batch: &TaskBatch, config: &Config) -> CoordinatorOptions {
    let mut options = CoordinatorOptions::from_config(config);
    if let Some(concurrency) = args.concurrency.or(batch.session.concurrency) {
        options = options.with_concurrency(concurrency);
    }
    if let Some(ms) = args.timeout.or(batch.session.timeout) {
        options = options.with_timeout(Duration::from_millis(ms));
    }
    options
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}

fn run_batch(args: RunArgs, config: &Config) -> Result<i32> {
    let batch = match (&args.tasks, &args.task) {
        (Some(path), _) => TaskBatch::load(path)?,
        (None, Some(description)) => TaskBatch::single(description, args.scope.clone()),
        (None, None) => {
            return Err(Error::Validation(
                "either --tasks or --task is required".to_string(),
            ))
        }
    };
    let options = resolve_options(&args, &batch, config);
    let base_branch = args
        .branch
        .clone()
        .or_else(|| batch.session.branch.clone())
        .or_else(|| config.base_branch.clone());
    let repo_path = std::env::current_dir()?;

    if !args.json {
        println!("Repository:  {}", repo_path.display());
        println!(
            "Tasks:       {} (concurrency {}, timeout {:?})",
            batch.tasks.len(),
            options.concurrency,
            options.default_timeout
        );
        for spec in &batch.tasks {
            println!("  - {} [{}] {}", spec.id, spec.task_type, spec.description);
        }
        println!();
    }

    if !args.yolo && !config.trust && !confirm("Run these tasks?")? {
        println!("Cancelled.");
        return Ok(0);
    }

    let agent = AgentCommand::from_config(config);
    if !agent.is_available() {
        return Err(Error::AgentNotAvailable(agent.binary().to_string()));
    }
    config.ensure_dirs()?;

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        let (events, mut event_rx) = EventSink::channel();
        let audit = Arc::new(JsonlAuditLog::new(config.audit_log_path()?));
        let ctx = CoordinatorContext::from_config(config, audit, events);

        let quiet = args.json;
        let printer = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if !quiet {
                    println!("  {}", event);
                }
            }
        });

        let tasks = batch.into_tasks();
        let needs_bidding = tasks.iter().any(|t| !t.candidates.is_empty());

        let mut coordinator = Coordinator::new(
            ctx.clone(),
            Arc::new(CommandExecutor::new(agent.clone(), &repo_path)),
            options,
        );
        if needs_bidding {
            let negotiator = NegotiationEngine::new(
                ctx.clone(),
                Arc::new(CommandBidSource::new(agent, &repo_path)),
                config.effective_bid_timeout(),
            );
            coordinator = coordinator.with_negotiator(Arc::new(negotiator));
        }
        if !args.no_worktrees {
            let workspace = Workspace::new(&repo_path, &config.worktrees_dir()?)?
                .with_base_branch(base_branch);
            coordinator = coordinator.with_workspace(Arc::new(workspace));
        }

        let cancel = CancellationToken::new();
        coordinator = coordinator.with_cancellation(cancel.clone());
        let abort = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                hlog_warn!("Interrupted, no new tasks will start");
                abort.cancel();
            }
        });

        let scaler = match args.rules.clone().or_else(|| config.rules_path()) {
            Some(rules) => {
                let engine = scaling_engine(&ctx, &rules, config);
                let interval = Duration::from_secs(args.scale_interval.max(1));
                let token = cancel.child_token();
                let stop = token.clone();
                let handle = tokio::spawn(async move { engine.run_every(interval, token).await });
                Some((handle, stop))
            }
            None => None,
        };

        coordinator.submit(tasks)?;
        let summary = coordinator.run().await?;

        if let Some((handle, stop)) = scaler {
            stop.cancel();
            if let Ok(cycles) = handle.await {
                hlog!("Scaling ran {} cycle(s) during the batch", cycles);
            }
        }

        ctx.audit.flush().await;
        for failure in ctx.audit.diagnostics().try_iter() {
            eprintln!("warning: audit write lost ({}): {}", failure.kind, failure.error);
        }

        drop(coordinator);
        drop(ctx);
        let _ = printer.await;
        Ok::<BatchSummary, Error>(summary)
    })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(if summary.has_failures() { 1 } else { 0 })
}

fn print_summary(summary: &BatchSummary) {
    println!();
    println!("Summary");
    println!("  Total:        {}", summary.total);
    println!("  Completed:    {}", summary.completed);
    println!("  Failed:       {}", summary.failed);
    println!("  Skipped:      {}", summary.skipped);
    println!("  Success rate: {:.0}%", summary.success_rate * 100.0);
    if summary.cancelled {
        println!("  Cancelled with {} task(s) unfinished", summary.unfinished);
    }
    for failed in &summary.failed_tasks {
        println!(
            "  \x1b[31mx\x1b[0m {} after {} attempt(s): {}",
            failed.id, failed.attempts, failed.error
        );
    }
}

fn scaling_engine(ctx: &CoordinatorContext, rules: &Path, config: &Config) -> ScalingEngine {
    let metrics = MetricRegistry::new().with_default(Arc::new(EnvMetrics));
    ScalingEngine::new(
        ctx.clone(),
        Arc::new(RuleFile::new(rules)),
        Arc::new(metrics),
    )
    .with_metric_fallback(config.metric_fallback)
}

fn run_scale(action: ScaleCommand, config: &Config) -> Result<i32> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        config.ensure_dirs()?;
        let audit = Arc::new(JsonlAuditLog::new(config.audit_log_path()?));
        let ctx = CoordinatorContext::from_config(config, audit, EventSink::disabled());

        let output = match action {
            ScaleCommand::Evaluate { rules } => {
                let rules = rules.or_else(|| config.rules_path()).ok_or_else(|| {
                    Error::Validation("no rule file: pass --rules or set `rules` in hive.toml".into())
                })?;
                scaling_engine(&ctx, &rules, config)
                    .evaluate_rules()
                    .await?
                    .summary()
            }
            ScaleCommand::Up {
                swarm_type,
                count,
                task,
            } => {
                let engine = scaling_engine(&ctx, Path::new(""), config);
                engine
                    .scale_swarm(&swarm_type, ScaleDirection::ScaleUp, count, task)
                    .await
                    .describe()
            }
            ScaleCommand::Down { swarm_type, count } => {
                let engine = scaling_engine(&ctx, Path::new(""), config);
                engine
                    .scale_swarm(&swarm_type, ScaleDirection::ScaleDown, count, None)
                    .await
                    .describe()
            }
        };
        println!("{}", output);

        ctx.audit.flush().await;
        let lost = ctx.audit.diagnostics().try_iter().count();
        Ok(if lost > 0 {
            eprintln!("warning: {} audit write(s) failed", lost);
            1
        } else {
            0
        })
    })
}
