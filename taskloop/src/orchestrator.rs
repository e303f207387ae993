//! The task loop: select, invoke, record usage, enforce budget, verify, finalize.
//!
//! One task per iteration, one worker. The task store on disk is the source of
//! truth: it is reloaded before every selection and after every invocation, so
//! a harness that edits task statuses itself is observed rather than
//! overwritten.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::ledger::{UsageLedger, UsageSummary};
use crate::core::types::{Task, TaskStatus, UsageRecord};
use crate::error::{InvocationError, StateVerificationFailure};
use crate::harness::{HarnessAdapter, InvokeOutcome, InvokeRequest};
use crate::io::config::{CleanStatePolicy, FailurePolicy};
use crate::io::prompt::PromptBuilder;
use crate::io::run_log::RunLog;
use crate::io::run_state::{RunState, write_run_state};
use crate::io::task_store::{load_task_store, update_task_status, write_task_store};
use crate::io::verify::{StateVerifier, Verdict, VerifyRequest};
use crate::session::Session;

/// Why a run stopped successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// No ready task is left (for the active filters and skip set).
    Complete,
    /// The configured iteration cap was reached.
    MaxIterations { limit: u32 },
    /// Usage went over the token ceiling.
    BudgetExceeded { used: u64, limit: u64 },
    /// `--once`: exactly one task was attempted.
    SingleIteration,
}

impl LoopStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStop::Complete => "complete",
            LoopStop::MaxIterations { .. } => "max_iterations",
            LoopStop::BudgetExceeded { .. } => "budget_exceeded",
            LoopStop::SingleIteration => "single_iteration",
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub iterations: u32,
    pub stop: LoopStop,
    pub usage: UsageSummary,
    /// Tasks closed by this run, in order.
    pub closed: Vec<String>,
    /// Tasks skipped after a failure under `move-on`.
    pub skipped: Vec<String>,
}

/// Progress reported to the caller and appended to the run log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    RunStarted {
        harness: String,
        streaming: bool,
        budget_tokens: Option<u64>,
        /// Tasks left in progress by an interrupted run, returned to open.
        reopened: Vec<String>,
    },
    /// A budget is set but the harness reports no token usage to count.
    BudgetUnenforceable {
        harness: String,
        budget_tokens: u64,
    },
    TaskStarted {
        iteration: u32,
        task_id: String,
        title: String,
    },
    HarnessFinished {
        iteration: u32,
        task_id: String,
        exit_code: i32,
        timed_out: bool,
        usage: UsageRecord,
    },
    BudgetWarning {
        used: u64,
        limit: u64,
        threshold_percent: u8,
    },
    Verification {
        task_id: String,
        passed: bool,
        reason: Option<String>,
    },
    TaskFinalized {
        task_id: String,
        status: TaskStatus,
        skipped: bool,
    },
    RunStopped {
        reason: String,
        iterations: u32,
        usage: UsageSummary,
    },
}

/// Run the loop until a stop condition or a fatal error.
///
/// Fatal errors are [`InvocationError`] (under `on_failure = "stop"`),
/// [`StateVerificationFailure`] (under `clean_state = "strict"`) and anything
/// that prevents reading or writing the task store.
pub fn run_loop<F: FnMut(&LoopEvent)>(
    session: &Session,
    adapter: &dyn HarnessAdapter,
    verifier: &dyn StateVerifier,
    on_event: F,
) -> Result<LoopOutcome> {
    Orchestrator {
        session,
        adapter,
        verifier,
        prompts: PromptBuilder::default(),
        log: RunLog::new(&session.paths.logs_dir, &session.run_id),
        ledger: session.ledger(),
        run_state: RunState {
            run_id: Some(session.run_id.clone()),
            harness: Some(session.harness_id.clone()),
            ..RunState::default()
        },
        skip: BTreeSet::new(),
        closed: Vec::new(),
        skipped: Vec::new(),
        on_event,
    }
    .run()
}

/// What finalizing one task decided.
enum Step {
    Continue,
    Stop(LoopStop),
}

struct Orchestrator<'a, F> {
    session: &'a Session,
    adapter: &'a dyn HarnessAdapter,
    verifier: &'a dyn StateVerifier,
    prompts: PromptBuilder,
    log: RunLog,
    ledger: UsageLedger,
    run_state: RunState,
    skip: BTreeSet<String>,
    closed: Vec<String>,
    skipped: Vec<String>,
    on_event: F,
}

impl<F: FnMut(&LoopEvent)> Orchestrator<'_, F> {
    #[instrument(skip_all, fields(run_id = %self.session.run_id, harness = %self.session.harness_id))]
    fn run(mut self) -> Result<LoopOutcome> {
        let store_path = self.session.task_store_path();
        let reopened = self.reopen_interrupted()?;
        let system_prompt = self
            .prompts
            .system_prompt(
                self.session.system_prompt_path().as_deref(),
                &self.session.config.task_store,
            )
            .context("build system prompt")?;

        self.emit(LoopEvent::RunStarted {
            harness: self.session.harness_id.clone(),
            streaming: self.session.streaming(),
            budget_tokens: self.ledger.limit(),
            reopened,
        })?;
        if let Some(budget_tokens) = self.ledger.limit()
            && !self.session.reports_tokens()
        {
            warn!(
                budget_tokens,
                "harness does not report token usage, budget cannot be enforced"
            );
            self.emit(LoopEvent::BudgetUnenforceable {
                harness: self.session.harness_id.clone(),
                budget_tokens,
            })?;
        }
        self.persist_run_state()?;

        let filter = self.session.config.ready_filter();
        let max_iterations = self.session.config.max_iterations;
        loop {
            if self.run_state.iterations >= max_iterations {
                return self.stop(LoopStop::MaxIterations {
                    limit: max_iterations,
                });
            }

            let graph = load_task_store(&store_path)?;
            let Some(task) = graph.next_ready(&filter, &self.skip).cloned() else {
                return self.stop(LoopStop::Complete);
            };
            let task_prompt = self
                .prompts
                .task_prompt(&graph, &task)
                .with_context(|| format!("build prompt for task '{}'", task.id))?;

            match self.run_task(&task, &system_prompt, task_prompt)? {
                Step::Continue if self.session.once => {
                    return self.stop(LoopStop::SingleIteration);
                }
                Step::Continue => {}
                Step::Stop(stop) => return self.stop(stop),
            }
        }
    }

    /// Return tasks stuck in progress from an interrupted run to open.
    fn reopen_interrupted(&self) -> Result<Vec<String>> {
        let store_path = self.session.task_store_path();
        let mut graph = load_task_store(&store_path)?;
        let reopened = graph.reopen_in_progress();
        if !reopened.is_empty() {
            warn!(tasks = ?reopened, "reopening tasks left in progress");
            write_task_store(&store_path, &graph)?;
        }
        Ok(reopened)
    }

    fn run_task(&mut self, task: &Task, system_prompt: &str, task_prompt: String) -> Result<Step> {
        let store_path = self.session.task_store_path();
        self.run_state.iterations += 1;
        let iteration = self.run_state.iterations;
        self.run_state.last_task = Some(task.id.clone());
        info!(iteration, task_id = %task.id, "starting task");

        update_task_status(&store_path, &task.id, TaskStatus::InProgress)?;
        self.emit(LoopEvent::TaskStarted {
            iteration,
            task_id: task.id.clone(),
            title: task.title.clone(),
        })?;

        let request = InvokeRequest {
            workdir: self.session.root().to_path_buf(),
            system_prompt: system_prompt.to_string(),
            task_prompt,
            debug: self.session.debug,
            echo: self.session.echo,
            timeout: self.session.config.invocation_timeout(),
            output_limit_bytes: self.session.config.output_limit_bytes,
            stream_path: Some(self.log.stream_path(iteration, &task.id)),
        };
        let outcome = match self.invoke(&request) {
            Ok(outcome) => outcome,
            Err(err) => {
                // Spawn failures are not policy-recoverable; leave the task retryable.
                self.settle(&task.id, TaskStatus::Open)?;
                return Err(err.context(format!("invoke harness for task '{}'", task.id)));
            }
        };
        self.run_state.last_exit_code = Some(outcome.exit_code);
        self.emit(LoopEvent::HarnessFinished {
            iteration,
            task_id: task.id.clone(),
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
            usage: outcome.usage,
        })?;

        self.record_usage(&outcome.usage)?;
        if self.ledger.check_over_budget() {
            let (used, limit) = (self.ledger.used(), self.ledger.limit().unwrap_or_default());
            warn!(used, limit, "token budget exceeded");
            // The task keeps whatever status the store holds now.
            return Ok(Step::Stop(LoopStop::BudgetExceeded { used, limit }));
        }

        if !outcome.success() {
            return self.handle_invocation_failure(task, &outcome);
        }

        let verdict = self.verifier.verify(&VerifyRequest {
            workdir: self.session.root().to_path_buf(),
            task_id: task.id.clone(),
            log_path: self.log.verify_log_path(iteration, &task.id),
        })?;
        let reason = match &verdict {
            Verdict::Pass => None,
            Verdict::Fail { reason } => Some(reason.clone()),
        };
        self.emit(LoopEvent::Verification {
            task_id: task.id.clone(),
            passed: verdict.passed(),
            reason: reason.clone(),
        })?;
        if let Some(reason) = reason {
            match self.session.config.clean_state {
                CleanStatePolicy::Strict => {
                    let status = self.settle(&task.id, TaskStatus::Open)?;
                    self.emit_finalized(&task.id, status, false)?;
                    self.persist_stop_reason("verification_failed")?;
                    return Err(StateVerificationFailure {
                        task_id: task.id.clone(),
                        reason,
                    }
                    .into());
                }
                CleanStatePolicy::Warn => {
                    warn!(task_id = %task.id, reason = %reason, "verification failed, closing anyway");
                }
            }
        }

        let status = self.settle(&task.id, TaskStatus::Closed)?;
        if status == TaskStatus::Closed {
            self.closed.push(task.id.clone());
        }
        self.emit_finalized(&task.id, status, false)?;
        self.persist_run_state()?;
        Ok(Step::Continue)
    }

    fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        if self.session.streaming() {
            debug!("dispatching streaming invocation");
            self.adapter.invoke_streaming(request)
        } else {
            debug!("dispatching plain invocation");
            self.adapter.invoke(request)
        }
    }

    fn record_usage(&mut self, usage: &UsageRecord) -> Result<()> {
        if usage.is_zero() && self.session.reports_tokens() {
            debug!("harness reports tokens but returned no usage for this invocation");
        }
        self.ledger.record_usage(usage);
        let threshold = self.session.config.warn_threshold_percent;
        if self.ledger.check_warning(threshold) {
            let used = self.ledger.used();
            let limit = self.ledger.limit().unwrap_or_default();
            warn!(used, limit, threshold, "token budget warning threshold crossed");
            self.emit(LoopEvent::BudgetWarning {
                used,
                limit,
                threshold_percent: threshold,
            })?;
        }
        self.run_state.usage = self.ledger.summary();
        Ok(())
    }

    fn handle_invocation_failure(&mut self, task: &Task, outcome: &InvokeOutcome) -> Result<Step> {
        warn!(
            task_id = %task.id,
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out,
            "harness invocation failed"
        );
        let status = self.settle(&task.id, TaskStatus::Open)?;
        match self.session.config.on_failure {
            FailurePolicy::Stop => {
                self.emit_finalized(&task.id, status, false)?;
                self.persist_stop_reason("invocation_failed")?;
                Err(InvocationError {
                    harness: self.session.harness_id.clone(),
                    task_id: task.id.clone(),
                    exit_code: outcome.exit_code,
                    timed_out: outcome.timed_out,
                }
                .into())
            }
            FailurePolicy::MoveOn => {
                self.skip.insert(task.id.clone());
                self.skipped.push(task.id.clone());
                self.emit_finalized(&task.id, status, true)?;
                self.persist_run_state()?;
                Ok(Step::Continue)
            }
        }
    }

    /// Move the task from in progress to `target`, honoring any status the
    /// harness wrote itself. Returns the status the store ends up with.
    fn settle(&self, task_id: &str, target: TaskStatus) -> Result<TaskStatus> {
        let store_path = self.session.task_store_path();
        let graph = load_task_store(&store_path)?;
        let current = graph
            .get(task_id)
            .map(|t| t.status)
            .with_context(|| format!("task '{task_id}' disappeared from the task store"))?;
        if current != TaskStatus::InProgress {
            debug!(task_id, current = %current, target = %target, "harness already settled task status");
            return Ok(current);
        }
        update_task_status(&store_path, task_id, target)?;
        Ok(target)
    }

    fn emit_finalized(&mut self, task_id: &str, status: TaskStatus, skipped: bool) -> Result<()> {
        self.emit(LoopEvent::TaskFinalized {
            task_id: task_id.to_string(),
            status,
            skipped,
        })
    }

    fn emit(&mut self, event: LoopEvent) -> Result<()> {
        self.log.append(&event)?;
        (self.on_event)(&event);
        Ok(())
    }

    fn persist_run_state(&self) -> Result<()> {
        write_run_state(&self.session.paths.run_state_path, &self.run_state)
    }

    fn persist_stop_reason(&mut self, reason: &str) -> Result<()> {
        self.run_state.stop_reason = Some(reason.to_string());
        self.emit(LoopEvent::RunStopped {
            reason: reason.to_string(),
            iterations: self.run_state.iterations,
            usage: self.ledger.summary(),
        })?;
        self.persist_run_state()
    }

    fn stop(mut self, stop: LoopStop) -> Result<LoopOutcome> {
        info!(reason = stop.as_str(), iterations = self.run_state.iterations, "loop stopped");
        self.run_state.usage = self.ledger.summary();
        self.persist_stop_reason(stop.as_str())?;
        Ok(LoopOutcome {
            run_id: self.session.run_id.clone(),
            iterations: self.run_state.iterations,
            stop,
            usage: self.ledger.summary(),
            closed: self.closed,
            skipped: self.skipped,
        })
    }
}
