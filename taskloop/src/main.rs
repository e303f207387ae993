//! Autonomous task-loop driver for coding-agent CLIs.
//!
//! Reads a dependency-aware backlog from `.taskloop/tasks.json`, hands the
//! next ready task to a harness (claude, opencode, codex, gemini, aider),
//! verifies the repository afterwards and keeps going until the backlog is
//! done, the token budget is spent or a policy says stop.

use std::env;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use taskloop::core::capability::{capabilities_of, known_harnesses};
use taskloop::core::graph::ReadyFilter;
use taskloop::core::ledger::parse_tokens;
use taskloop::error::{InvocationError, StateVerificationFailure, ValidationError};
use taskloop::exit_codes;
use taskloop::harness::registry::HarnessRegistry;
use taskloop::io::config::{LoopConfig, load_config};
use taskloop::io::init::{InitOptions, LoopPaths, init_taskloop};
use taskloop::io::run_log::new_run_id;
use taskloop::io::run_state::load_run_state;
use taskloop::io::task_store::load_task_store;
use taskloop::io::verify::WorkspaceVerifier;
use taskloop::logging;
use taskloop::orchestrator::{LoopEvent, LoopOutcome, run_loop};
use taskloop::session::Session;

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Drive coding-agent CLIs through a dependency-aware task backlog"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.taskloop/` with a default config and an empty task store.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Check the task store against its schema and invariants.
    Validate,
    /// Print ready task ids in scheduling order (exit 2 when none).
    Ready {
        #[arg(long)]
        epic: Option<String>,
        #[arg(long)]
        label: Option<String>,
    },
    /// Print open tasks waiting on unfinished dependencies.
    Blocked,
    /// Print the harness capability table.
    Capabilities {
        /// Show a single harness.
        harness: Option<String>,
    },
    /// Run the loop.
    Run(RunArgs),
    /// Print the last persisted run state.
    Status,
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Harness id or `auto`.
    #[arg(long)]
    harness: Option<String>,
    /// Token ceiling for this run.
    #[arg(long, value_parser = parse_tokens)]
    budget: Option<u64>,
    /// Stop after one task.
    #[arg(long)]
    once: bool,
    /// Only schedule tasks under this epic.
    #[arg(long)]
    epic: Option<String>,
    /// Only schedule tasks with this label.
    #[arg(long)]
    label: Option<String>,
    /// Debug logging and raw harness output on stderr.
    #[arg(long)]
    debug: bool,
    /// Print harness output as it arrives.
    #[arg(long)]
    echo: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut LoopConfig) {
        if let Some(harness) = &self.harness {
            config.harness = harness.clone();
        }
        if let Some(budget) = self.budget {
            config.budget_tokens = Some(budget);
        }
        if let Some(epic) = &self.epic {
            config.epic = Some(epic.clone());
        }
        if let Some(label) = &self.label {
            config.label = Some(label.clone());
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let debug = matches!(&cli.command, Command::Run(args) if args.debug);
    logging::init(debug);

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(hint) = hint(&err) {
                eprintln!("hint: {hint}");
            }
            process::exit(exit_code(&err));
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = match cli.root {
        Some(root) => root,
        None => env::current_dir().context("resolve current directory")?,
    };
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Validate => cmd_validate(&root),
        Command::Ready { epic, label } => cmd_ready(&root, ReadyFilter { epic, label }),
        Command::Blocked => cmd_blocked(&root),
        Command::Capabilities { harness } => cmd_capabilities(harness.as_deref()),
        Command::Run(args) => cmd_run(&root, &args),
        Command::Status => cmd_status(&root),
    }
}

fn load_effective_config(root: &Path) -> Result<LoopConfig> {
    let paths = LoopPaths::new(root);
    let config = load_config(&paths.config_path)?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", paths.config_path.display()))?;
    Ok(config)
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_taskloop(root, &InitOptions { force })?;
    println!("initialized {}", paths.loop_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let config = load_effective_config(root)?;
    let graph = load_task_store(&config.task_store_path(root))?;
    let summary = graph.summary();
    println!(
        "ok: {} tasks ({} open, {} in progress, {} closed; {} ready, {} blocked)",
        graph.tasks().len(),
        summary.open,
        summary.in_progress,
        summary.closed,
        summary.ready,
        summary.blocked
    );
    Ok(exit_codes::OK)
}

fn cmd_ready(root: &Path, filter: ReadyFilter) -> Result<i32> {
    let config = load_effective_config(root)?;
    let graph = load_task_store(&config.task_store_path(root))?;
    let filter = ReadyFilter {
        epic: filter.epic.or(config.epic),
        label: filter.label.or(config.label),
    };
    let ready = graph.ready_tasks(&filter);
    if ready.is_empty() {
        eprintln!("no ready task");
        return Ok(exit_codes::NO_READY_TASK);
    }
    for task in ready {
        println!("{}", task.id);
    }
    Ok(exit_codes::OK)
}

fn cmd_blocked(root: &Path) -> Result<i32> {
    let config = load_effective_config(root)?;
    let graph = load_task_store(&config.task_store_path(root))?;
    for task in graph.blocked_tasks() {
        println!(
            "{}: waiting on {}",
            task.id,
            graph.unresolved_dependencies(task).join(", ")
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_capabilities(harness: Option<&str>) -> Result<i32> {
    let rows: Vec<_> = match harness {
        Some(id) => vec![capabilities_of(id)],
        None => known_harnesses().map(capabilities_of).collect(),
    };
    let payload = serde_json::to_string_pretty(&rows).context("serialize capability table")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, args: &RunArgs) -> Result<i32> {
    let mut config = load_effective_config(root)?;
    args.apply(&mut config);
    config.validate().context("invalid run options")?;

    let registry = HarnessRegistry::with_defaults();
    let adapter = registry.detect_harness(&config.harness)?;
    let verifier = WorkspaceVerifier::from_config(&config);

    let mut session = Session::new(root, new_run_id(), adapter.id(), config);
    session.once = args.once;
    session.debug = args.debug;
    session.echo = args.echo;

    eprintln!(
        "taskloop: run {} with {} (streaming: {})",
        session.run_id,
        session.harness_id,
        session.streaming()
    );
    let outcome = run_loop(&session, adapter, &verifier, print_event)?;
    print_outcome(&outcome)?;
    Ok(exit_codes::OK)
}

fn print_event(event: &LoopEvent) {
    match event {
        LoopEvent::RunStarted { reopened, .. } if !reopened.is_empty() => {
            eprintln!("reopened interrupted tasks: {}", reopened.join(", "));
        }
        LoopEvent::BudgetUnenforceable {
            harness,
            budget_tokens,
        } => eprintln!(
            "warning: {harness} does not report token usage; the {budget_tokens}-token budget will not be enforced"
        ),
        LoopEvent::TaskStarted {
            iteration,
            task_id,
            title,
        } => eprintln!("[{iteration}] {task_id}: {title}"),
        LoopEvent::HarnessFinished {
            exit_code, usage, ..
        } => eprintln!(
            "    harness exited {exit_code} ({} in / {} out{})",
            usage.input_tokens,
            usage.output_tokens,
            if usage.estimated { ", estimated" } else { "" }
        ),
        LoopEvent::BudgetWarning {
            used,
            limit,
            threshold_percent,
        } => eprintln!("warning: {used} of {limit} tokens used (>= {threshold_percent}%)"),
        LoopEvent::Verification {
            passed: false,
            reason: Some(reason),
            ..
        } => eprintln!("    verification failed: {reason}"),
        LoopEvent::TaskFinalized {
            task_id, status, ..
        } => eprintln!("    {task_id} -> {status}"),
        _ => {}
    }
}

fn print_outcome(outcome: &LoopOutcome) -> Result<()> {
    eprintln!(
        "stopped: {} after {} iteration(s); closed {}, skipped {}",
        outcome.stop.as_str(),
        outcome.iterations,
        outcome.closed.len(),
        outcome.skipped.len()
    );
    let usage = serde_json::json!({
        "input_tokens": outcome.usage.input_tokens,
        "output_tokens": outcome.usage.output_tokens,
        "cache_read_tokens": outcome.usage.cache_read_tokens,
        "cache_creation_tokens": outcome.usage.cache_creation_tokens,
        "cost_usd": outcome.usage.cost_usd,
        "estimated": outcome.usage.estimated,
    });
    let payload = serde_json::to_string_pretty(&usage).context("serialize usage")?;
    println!("{payload}");
    Ok(())
}

fn cmd_status(root: &Path) -> Result<i32> {
    let paths = LoopPaths::new(root);
    match load_run_state(&paths.run_state_path)? {
        Some(state) => {
            let payload = serde_json::to_string_pretty(&state).context("serialize run state")?;
            println!("{payload}");
        }
        None => println!("no runs recorded"),
    }
    Ok(exit_codes::OK)
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<InvocationError>().is_some() {
        exit_codes::INVOCATION_FAILED
    } else if err.downcast_ref::<StateVerificationFailure>().is_some() {
        exit_codes::VERIFICATION_FAILED
    } else {
        exit_codes::INVALID
    }
}

/// Which knob to turn for the failures a user can act on.
fn hint(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(failure) = err.downcast_ref::<InvocationError>() {
        return Some(if failure.timed_out {
            "raise `invocation_timeout_secs`, or set `on_failure = \"move-on\"` to skip failing tasks"
        } else {
            "inspect the harness stream under .taskloop/logs/, or set `on_failure = \"move-on\"`"
        });
    }
    if err.downcast_ref::<StateVerificationFailure>().is_some() {
        return Some(
            "commit or discard the leftover changes, or set `clean_state = \"warn\"` in .taskloop/config.toml",
        );
    }
    if err.downcast_ref::<ValidationError>().is_some() {
        return Some("fix the listed tasks in the task store, then run `taskloop validate`");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["taskloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_overrides() {
        let cli = Cli::parse_from([
            "taskloop", "run", "--harness", "codex", "--budget", "50_000", "--once", "--label",
            "backend",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut config = LoopConfig::default();
        args.apply(&mut config);
        assert_eq!(config.harness, "codex");
        assert_eq!(config.budget_tokens, Some(50_000));
        assert_eq!(config.label.as_deref(), Some("backend"));
        assert_eq!(config.epic, None);
        assert!(args.once);
    }

    #[test]
    fn negative_budget_is_rejected() {
        assert!(Cli::try_parse_from(["taskloop", "run", "--budget", "-5"]).is_err());
    }

    #[test]
    fn typed_errors_map_to_exit_codes() {
        let invocation: anyhow::Error = InvocationError {
            harness: "claude".to_string(),
            task_id: "t1".to_string(),
            exit_code: 1,
            timed_out: false,
        }
        .into();
        assert_eq!(exit_code(&invocation), exit_codes::INVOCATION_FAILED);
        assert!(hint(&invocation).is_some());

        let verification: anyhow::Error = StateVerificationFailure {
            task_id: "t1".to_string(),
            reason: "dirty".to_string(),
        }
        .into();
        let verification = verification.context("run loop");
        assert_eq!(exit_code(&verification), exit_codes::VERIFICATION_FAILED);

        let other = anyhow::anyhow!("bad config");
        assert_eq!(exit_code(&other), exit_codes::INVALID);
        assert_eq!(hint(&other), None);
    }
}
