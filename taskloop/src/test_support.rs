//! Test-only helpers: task builders, scripted harness/verifier, temp repos.

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::graph::TaskGraph;
use crate::core::types::{Priority, Task, TaskStatus, TaskType, UsageRecord};
use crate::harness::{HarnessAdapter, InvokeOutcome, InvokeRequest};
use crate::io::config::LoopConfig;
use crate::io::git::Git;
use crate::io::init::{InitOptions, init_taskloop};
use crate::io::task_store::{load_task_store, write_task_store};
use crate::io::verify::{StateVerifier, Verdict, VerifyRequest};
use crate::session::Session;

/// Open task with deterministic defaults and no dependencies.
pub fn task(id: &str, priority: Priority) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        kind: TaskType::Task,
        status: TaskStatus::Open,
        priority,
        description: String::new(),
        depends_on: BTreeSet::new(),
        labels: BTreeSet::new(),
        parent: None,
    }
}

/// Open task depending on `deps`.
pub fn task_with_deps(id: &str, priority: Priority, deps: &[&str]) -> Task {
    Task {
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        ..task(id, priority)
    }
}

/// Closed task at default priority.
pub fn closed(id: &str) -> Task {
    Task {
        status: TaskStatus::Closed,
        ..task(id, Priority::default())
    }
}

type Effect = Box<dyn Fn(&InvokeRequest) -> Result<()>>;

/// One predetermined harness response.
pub struct ScriptedInvocation {
    pub outcome: InvokeOutcome,
    /// Runs before the outcome is returned, e.g. to edit the task store.
    pub effect: Option<Effect>,
}

impl ScriptedInvocation {
    pub fn ok(usage: UsageRecord) -> Self {
        Self {
            outcome: InvokeOutcome {
                exit_code: 0,
                display_text: "done".to_string(),
                usage,
                timed_out: false,
                stderr: String::new(),
            },
            effect: None,
        }
    }

    pub fn exit(code: i32) -> Self {
        let mut scripted = Self::ok(UsageRecord::default());
        scripted.outcome.exit_code = code;
        scripted.outcome.display_text = String::new();
        scripted
    }

    pub fn timed_out() -> Self {
        let mut scripted = Self::exit(crate::io::process::TIMEOUT_EXIT_CODE);
        scripted.outcome.timed_out = true;
        scripted
    }

    pub fn with_effect(mut self, effect: impl Fn(&InvokeRequest) -> Result<()> + 'static) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }
}

/// What a [`ScriptedAdapter`] was asked to do.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub streaming: bool,
    pub system_prompt: String,
    pub task_prompt: String,
}

/// Adapter that replays queued outcomes without spawning processes.
pub struct ScriptedAdapter {
    id: String,
    script: RefCell<VecDeque<ScriptedInvocation>>,
    calls: RefCell<Vec<RecordedCall>>,
}

impl ScriptedAdapter {
    pub fn new(id: &str, script: Vec<ScriptedInvocation>) -> Self {
        Self {
            id: id.to_string(),
            script: RefCell::new(script.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    fn next(&self, request: &InvokeRequest, streaming: bool) -> Result<InvokeOutcome> {
        self.calls.borrow_mut().push(RecordedCall {
            streaming,
            system_prompt: request.system_prompt.clone(),
            task_prompt: request.task_prompt.clone(),
        });
        let scripted = self
            .script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted adapter exhausted"))?;
        if let Some(effect) = &scripted.effect {
            effect(request)?;
        }
        Ok(scripted.outcome)
    }
}

impl HarnessAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn binary(&self) -> &str {
        "scripted"
    }

    fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        self.next(request, false)
    }

    fn invoke_streaming(&self, request: &InvokeRequest) -> Result<InvokeOutcome> {
        self.next(request, true)
    }
}

/// Verifier that replays queued verdicts, passing once the queue is empty.
pub struct ScriptedVerifier {
    verdicts: RefCell<VecDeque<Verdict>>,
}

impl ScriptedVerifier {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        Self {
            verdicts: RefCell::new(verdicts.into()),
        }
    }

    pub fn passing() -> Self {
        Self::new(Vec::new())
    }
}

impl StateVerifier for ScriptedVerifier {
    fn verify(&self, _request: &VerifyRequest) -> Result<Verdict> {
        Ok(self
            .verdicts
            .borrow_mut()
            .pop_front()
            .unwrap_or(Verdict::Pass))
    }
}

/// Temporary git repository with `.taskloop/` initialized and committed.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let git = Git::new(dir.path());
        git.init()?;
        init_taskloop(dir.path(), &InitOptions { force: false })?;
        git.add_all()?;
        git.commit_staged("chore: init taskloop")?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    /// Replace the default task store with `tasks`.
    pub fn write_tasks(&self, tasks: &[Task]) -> Result<()> {
        write_task_store(
            &LoopConfig::default().task_store_path(self.root()),
            &TaskGraph::new(tasks.to_vec()),
        )
    }

    pub fn read_graph(&self) -> Result<TaskGraph> {
        load_task_store(&LoopConfig::default().task_store_path(self.root()))
    }

    pub fn commit_all(&self, message: &str) -> Result<bool> {
        let git = Git::new(self.root());
        git.add_all()?;
        git.commit_staged(message)
    }

    pub fn session(&self, harness_id: &str, config: LoopConfig) -> Session {
        Session::new(self.root(), "run-test", harness_id, config)
    }
}
