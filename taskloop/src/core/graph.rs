//! Dependency-aware scheduling over the task backlog.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::types::{Task, TaskStatus};
use crate::error::{TransitionError, ValidationError};

/// Optional scheduling filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyFilter {
    /// Only tasks whose `parent` is this epic.
    pub epic: Option<String>,
    /// Only tasks carrying this label.
    pub label: Option<String>,
}

impl ReadyFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(epic) = &self.epic
            && task.parent.as_deref() != Some(epic.as_str())
        {
            return false;
        }
        if let Some(label) = &self.label
            && !task.labels.contains(label)
        {
            return false;
        }
        true
    }
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphSummary {
    pub open: usize,
    pub in_progress: usize,
    pub closed: usize,
    pub ready: usize,
    pub blocked: usize,
}

/// The backlog, in store order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn closed_ids(&self) -> HashSet<&str> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Closed)
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Open tasks whose dependencies are all closed, P0 first.
    ///
    /// The sort is stable, so equal priorities keep store order.
    pub fn ready_tasks(&self, filter: &ReadyFilter) -> Vec<&Task> {
        let closed = self.closed_ids();
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Open)
            .filter(|t| t.depends_on.iter().all(|d| closed.contains(d.as_str())))
            .filter(|t| filter.matches(t))
            .collect();
        ready.sort_by_key(|t| t.priority);
        ready
    }

    /// First ready task not in `skip`.
    pub fn next_ready(&self, filter: &ReadyFilter, skip: &BTreeSet<String>) -> Option<&Task> {
        self.ready_tasks(filter)
            .into_iter()
            .find(|t| !skip.contains(&t.id))
    }

    /// Open tasks with at least one dependency that is missing or not closed.
    ///
    /// Members of a dependency cycle land here forever; cycles are not an error.
    pub fn blocked_tasks(&self) -> Vec<&Task> {
        let closed = self.closed_ids();
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Open)
            .filter(|t| t.depends_on.iter().any(|d| !closed.contains(d.as_str())))
            .collect()
    }

    /// Dependencies of `task` that are not closed yet, in id order.
    pub fn unresolved_dependencies<'a>(&self, task: &'a Task) -> Vec<&'a str> {
        let closed = self.closed_ids();
        task.depends_on
            .iter()
            .filter(|d| !closed.contains(d.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Check structural invariants: required fields, unique ids, resolvable references.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let issues = validate_tasks(&self.tasks);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }

    /// Apply a lifecycle transition and return the previous status.
    pub fn set_status(&mut self, id: &str, next: TaskStatus) -> Result<TaskStatus, TransitionError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TransitionError::UnknownTask(id.to_string()))?;
        let prev = task.status;
        if !prev.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                id: id.to_string(),
                from: prev,
                to: next,
            });
        }
        task.status = next;
        Ok(prev)
    }

    /// Return every `in_progress` task to `open`; yields the ids touched.
    pub fn reopen_in_progress(&mut self) -> Vec<String> {
        let mut reopened = Vec::new();
        for task in &mut self.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Open;
                reopened.push(task.id.clone());
            }
        }
        reopened
    }

    pub fn summary(&self) -> GraphSummary {
        let mut summary = GraphSummary::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Open => summary.open += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Closed => summary.closed += 1,
            }
        }
        summary.ready = self.ready_tasks(&ReadyFilter::default()).len();
        summary.blocked = self.blocked_tasks().len();
        summary
    }
}

fn validate_tasks(tasks: &[Task]) -> Vec<String> {
    let mut issues = Vec::new();
    let mut seen: HashMap<&str, usize> = HashMap::new();

    for (idx, task) in tasks.iter().enumerate() {
        let label = if task.id.trim().is_empty() {
            format!("tasks[{idx}]")
        } else {
            format!("task '{}'", task.id)
        };
        if task.id.trim().is_empty() {
            issues.push(format!("{label}: missing required field 'id'"));
        } else if let Some(first) = seen.insert(task.id.as_str(), idx) {
            issues.push(format!(
                "duplicate id '{}' at tasks[{}] (first seen at tasks[{}])",
                task.id, idx, first
            ));
        }
        if task.title.trim().is_empty() {
            issues.push(format!("{label}: missing required field 'title'"));
        }
    }

    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                issues.push(format!("task '{}': unknown dependency '{}'", task.id, dep));
            }
        }
        if let Some(parent) = &task.parent
            && !ids.contains(parent.as_str())
        {
            issues.push(format!("task '{}': unknown parent '{}'", task.id, parent));
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Priority;
    use crate::test_support::{closed, task, task_with_deps};

    fn ids(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn scenario_dependency_unblocks_after_close() {
        let mut graph = TaskGraph::new(vec![
            task("t1", Priority::P1),
            task_with_deps("t2", Priority::P0, &["t1"]),
        ]);
        assert_eq!(ids(&graph.ready_tasks(&ReadyFilter::default())), vec!["t1"]);

        graph.set_status("t1", TaskStatus::InProgress).expect("start");
        graph.set_status("t1", TaskStatus::Closed).expect("close");
        assert_eq!(ids(&graph.ready_tasks(&ReadyFilter::default())), vec!["t2"]);
    }

    #[test]
    fn ready_is_sorted_by_priority_and_stable_on_ties() {
        let graph = TaskGraph::new(vec![
            task("b", Priority::P2),
            task("a", Priority::P2),
            task("c", Priority::P0),
            task("d", Priority::P4),
            task("e", Priority::P2),
        ]);
        assert_eq!(
            ids(&graph.ready_tasks(&ReadyFilter::default())),
            vec!["c", "b", "a", "e", "d"]
        );
    }

    #[test]
    fn readiness_requires_open_status_and_closed_deps() {
        let mut in_progress = task("busy", Priority::P0);
        in_progress.status = TaskStatus::InProgress;
        let graph = TaskGraph::new(vec![
            closed("done"),
            in_progress,
            task_with_deps("ok", Priority::P1, &["done"]),
            task_with_deps("waits", Priority::P1, &["busy"]),
        ]);
        let ready = graph.ready_tasks(&ReadyFilter::default());
        assert_eq!(ids(&ready), vec!["ok"]);
        assert_eq!(ids(&graph.blocked_tasks()), vec!["waits"]);
        for t in graph.tasks() {
            let expected = t.status == TaskStatus::Open
                && t.depends_on
                    .iter()
                    .all(|d| graph.get(d).is_some_and(|dep| dep.status == TaskStatus::Closed));
            assert_eq!(ready.iter().any(|r| r.id == t.id), expected, "task {}", t.id);
        }
    }

    #[test]
    fn cycles_are_blocked_not_ready() {
        let graph = TaskGraph::new(vec![
            task_with_deps("a", Priority::P0, &["b"]),
            task_with_deps("b", Priority::P0, &["a"]),
            task("c", Priority::P3),
        ]);
        assert_eq!(ids(&graph.ready_tasks(&ReadyFilter::default())), vec!["c"]);
        assert_eq!(ids(&graph.blocked_tasks()), vec!["a", "b"]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn filters_apply_epic_and_label() {
        let mut a = task("a", Priority::P1);
        a.parent = Some("epic-1".to_string());
        a.labels.insert("backend".to_string());
        let mut b = task("b", Priority::P0);
        b.parent = Some("epic-1".to_string());
        let mut epic = task("epic-1", Priority::P0);
        epic.status = TaskStatus::Closed;
        let graph = TaskGraph::new(vec![epic, a, b, task("c", Priority::P0)]);

        let by_epic = ReadyFilter {
            epic: Some("epic-1".to_string()),
            label: None,
        };
        assert_eq!(ids(&graph.ready_tasks(&by_epic)), vec!["b", "a"]);

        let by_both = ReadyFilter {
            epic: Some("epic-1".to_string()),
            label: Some("backend".to_string()),
        };
        assert_eq!(ids(&graph.ready_tasks(&by_both)), vec!["a"]);
    }

    #[test]
    fn next_ready_honors_skip_set() {
        let graph = TaskGraph::new(vec![task("a", Priority::P0), task("b", Priority::P1)]);
        let skip: BTreeSet<String> = ["a".to_string()].into_iter().collect();
        let next = graph.next_ready(&ReadyFilter::default(), &skip).expect("next");
        assert_eq!(next.id, "b");
    }

    #[test]
    fn validate_reports_every_issue() {
        let mut untitled = task("x", Priority::P2);
        untitled.title = String::new();
        let mut orphan = task("y", Priority::P2);
        orphan.parent = Some("nope".to_string());
        let graph = TaskGraph::new(vec![
            task("dup", Priority::P1),
            task("dup", Priority::P2),
            task_with_deps("z", Priority::P1, &["ghost"]),
            untitled,
            orphan,
            task("", Priority::P1),
        ]);
        let err = graph.validate().expect_err("invalid");
        let joined = err.issues.join("\n");
        assert!(joined.contains("duplicate id 'dup'"));
        assert!(joined.contains("unknown dependency 'ghost'"));
        assert!(joined.contains("task 'x': missing required field 'title'"));
        assert!(joined.contains("unknown parent 'nope'"));
        assert!(joined.contains("tasks[5]: missing required field 'id'"));
    }

    #[test]
    fn set_status_rejects_illegal_transitions() {
        let mut graph = TaskGraph::new(vec![closed("done"), task("open", Priority::P1)]);
        assert!(matches!(
            graph.set_status("done", TaskStatus::InProgress),
            Err(TransitionError::Illegal { .. })
        ));
        assert!(matches!(
            graph.set_status("open", TaskStatus::Closed),
            Err(TransitionError::Illegal { .. })
        ));
        assert_eq!(
            graph.set_status("missing", TaskStatus::Open),
            Err(TransitionError::UnknownTask("missing".to_string()))
        );
        assert_eq!(
            graph.set_status("open", TaskStatus::InProgress),
            Ok(TaskStatus::Open)
        );
    }

    #[test]
    fn reopen_in_progress_returns_touched_ids() {
        let mut busy = task("busy", Priority::P1);
        busy.status = TaskStatus::InProgress;
        let mut graph = TaskGraph::new(vec![busy, task("idle", Priority::P1)]);
        assert_eq!(graph.reopen_in_progress(), vec!["busy".to_string()]);
        assert_eq!(graph.summary().open, 2);
    }
}
