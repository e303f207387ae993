//! Prompt rendering for harness invocations.
//!
//! Both prompts are minijinja templates compiled into the binary. The task
//! prompt is split into marked sections so optional context can be dropped
//! when the prompt would exceed its byte budget.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::graph::TaskGraph;
use crate::core::types::Task;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Default byte budget for the rendered task prompt.
pub const DEFAULT_TASK_PROMPT_BUDGET: usize = 32_000;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .unwrap_or_else(|err| panic!("section marker regex: {err}"))
});

#[derive(Debug, Clone, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    title: &'a str,
    kind: &'static str,
    priority: &'static str,
    description: &'a str,
    labels: Vec<&'a str>,
    parent: Option<&'a str>,
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            title: &task.title,
            kind: task.kind.as_str(),
            priority: task.priority.as_str(),
            description: task.description.trim(),
            labels: task.labels.iter().map(String::as_str).collect(),
            parent: task.parent.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct DependencyContext<'a> {
    id: &'a str,
    title: &'a str,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system prompt template")?;
        env.add_template("task", TASK_TEMPLATE)
            .context("load task prompt template")?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let required = kind.as_str() == "required";
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

/// Drop optional sections (dependencies, then description) until the rendered
/// prompt, separators included, fits; truncate the last section if it still
/// does not.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in ["dependencies", "description"] {
        if rendered_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    if rendered_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let other_len = if rest.is_empty() {
        0
    } else {
        rendered_len(rest) + SECTION_SEPARATOR.len()
    };
    let allowed = budget.saturating_sub(other_len);
    let marker = "\n[truncated]";
    let keep = if allowed > marker.len() {
        allowed - marker.len()
    } else {
        allowed
    };
    let cut = floor_char_boundary(&last.content, keep);
    last.content.truncate(cut);
    if allowed > marker.len() {
        last.content.push_str(marker);
    }
    debug!(section = %last.key, after_len = last.content.len(), "truncated prompt section");
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

const SECTION_SEPARATOR: &str = "\n\n";

/// Length of `render_sections(sections)` without rendering.
fn rendered_len(sections: &[ParsedSection]) -> usize {
    let content: usize = sections.iter().map(|s| s.content.len()).sum();
    content + SECTION_SEPARATOR.len() * sections.len().saturating_sub(1)
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join(SECTION_SEPARATOR)
}

/// Builds system and task prompts.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_PROMPT_BUDGET)
    }
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// The loop contract. A custom prompt file replaces the template verbatim.
    pub fn system_prompt(&self, custom_path: Option<&Path>, store_path: &Path) -> Result<String> {
        if let Some(path) = custom_path {
            return fs::read_to_string(path)
                .with_context(|| format!("read system prompt {}", path.display()));
        }
        let engine = PromptEngine::new()?;
        let rendered = engine.render(
            "system",
            context! { store_path => store_path.display().to_string() },
        )?;
        Ok(render_sections(&parse_sections(&rendered)))
    }

    /// Prompt describing `task`, with its closed dependencies for context.
    pub fn task_prompt(&self, graph: &TaskGraph, task: &Task) -> Result<String> {
        let engine = PromptEngine::new()?;
        let dependencies: Vec<DependencyContext<'_>> = task
            .depends_on
            .iter()
            .filter_map(|id| graph.get(id))
            .map(|dep| DependencyContext {
                id: &dep.id,
                title: &dep.title,
            })
            .collect();
        let rendered = engine.render(
            "task",
            context! {
                task => TaskContext::from_task(task),
                dependencies => dependencies,
            },
        )?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}
