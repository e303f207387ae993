//! Shared deterministic types for the loop core.
//!
//! These types define the contracts between the scheduler, the harness
//! adapters and the usage ledger. They carry no I/O and serialize to the
//! task store / usage report formats.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Persisted task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Closed => "closed",
        }
    }

    /// Whether `self -> next` is an allowed lifecycle transition.
    ///
    /// `open -> in_progress -> {closed | open}`; staying put is always allowed.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Open, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Closed)
                | (TaskStatus::InProgress, TaskStatus::Open)
        ) || self == next
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Task,
    Bug,
    Feature,
    Chore,
    Epic,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Task => "task",
            TaskType::Bug => "bug",
            TaskType::Feature => "feature",
            TaskType::Chore => "chore",
            TaskType::Epic => "epic",
        }
    }
}

/// Task priority, `P0` (highest) through `P4`. Ordering follows urgency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
    P4,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
            Priority::P4 => "P4",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backlog entry as stored in the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: TaskType,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

/// Optional behaviors a harness may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Emits a machine-readable event stream on stdout.
    Streaming,
    /// Reports token counts natively.
    TokenReporting,
    /// Accepts the system prompt on a separate channel.
    SystemPrompt,
    /// Can run unattended with tool approvals granted up front.
    AutoMode,
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(Capability::Streaming),
            "tokenReporting" | "token_reporting" => Ok(Capability::TokenReporting),
            "systemPrompt" | "system_prompt" => Ok(Capability::SystemPrompt),
            "autoMode" | "auto_mode" => Ok(Capability::AutoMode),
            other => Err(format!("unknown capability '{other}'")),
        }
    }
}

/// Token/cost accounting for one harness invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: Option<f64>,
    pub estimated: bool,
}

/// Tokens per dollar used when a backend reports cost but no token counts.
pub const TOKENS_PER_USD_ESTIMATE: f64 = 150_000.0;

impl UsageRecord {
    /// Tokens charged against the budget (cache traffic is reported, not charged).
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read_tokens == 0
            && self.cache_creation_tokens == 0
            && self.cost_usd.is_none()
    }

    /// Sum another record into this one. Costs add when either side has one.
    pub fn accumulate(&mut self, other: &UsageRecord) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_tokens = self
            .cache_read_tokens
            .saturating_add(other.cache_read_tokens);
        self.cache_creation_tokens = self
            .cache_creation_tokens
            .saturating_add(other.cache_creation_tokens);
        self.cost_usd = match (self.cost_usd, other.cost_usd) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.estimated |= other.estimated;
    }

    /// Derive token counts from cost when the backend reported none.
    ///
    /// Applies only when both input and output are zero and a positive cost is
    /// present: `total = round(cost * 150000)`, one third input, the rest output.
    /// Genuine token counts are never replaced.
    pub fn with_cost_estimate(mut self) -> Self {
        if self.input_tokens != 0 || self.output_tokens != 0 {
            return self;
        }
        let Some(cost) = self.cost_usd.filter(|c| c.is_finite() && *c > 0.0) else {
            return self;
        };
        let total = (cost * TOKENS_PER_USD_ESTIMATE).round() as u64;
        if total == 0 {
            return self;
        }
        self.input_tokens = total / 3;
        self.output_tokens = total - self.input_tokens;
        self.estimated = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_lifecycle() {
        assert!(TaskStatus::Open.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Closed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Open));
        assert!(TaskStatus::Closed.can_transition_to(TaskStatus::Closed));
        assert!(!TaskStatus::Open.can_transition_to(TaskStatus::Closed));
        assert!(!TaskStatus::Closed.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Closed.can_transition_to(TaskStatus::Open));
    }

    #[test]
    fn priority_orders_p0_first() {
        let mut priorities = vec![Priority::P3, Priority::P0, Priority::P4, Priority::P1];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::P0, Priority::P1, Priority::P3, Priority::P4]
        );
    }

    #[test]
    fn task_uses_camel_case_store_fields() {
        let raw = r#"{"id":"t2","title":"Second","type":"bug","status":"in_progress",
            "priority":"P0","dependsOn":["t1"],"labels":["core"],"parent":"e1"}"#;
        let task: Task = serde_json::from_str(raw).expect("parse");
        assert_eq!(task.kind, TaskType::Bug);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.priority, Priority::P0);
        assert!(task.depends_on.contains("t1"));
        assert_eq!(task.parent.as_deref(), Some("e1"));
        assert_eq!(task.description, "");

        let value = serde_json::to_value(&task).expect("serialize");
        assert_eq!(value["dependsOn"][0], "t1");
        assert_eq!(value["type"], "bug");
    }

    #[test]
    fn estimate_applies_only_without_token_counts() {
        let estimated = UsageRecord {
            cost_usd: Some(0.10),
            ..UsageRecord::default()
        }
        .with_cost_estimate();
        assert!(estimated.estimated);
        assert_eq!(estimated.input_tokens, 5_000);
        assert_eq!(estimated.output_tokens, 10_000);

        let genuine = UsageRecord {
            input_tokens: 5,
            output_tokens: 5,
            cost_usd: Some(3.0),
            ..UsageRecord::default()
        }
        .with_cost_estimate();
        assert!(!genuine.estimated);
        assert_eq!(genuine.total_tokens(), 10);
    }

    #[test]
    fn estimate_ignores_missing_or_zero_cost() {
        assert!(!UsageRecord::default().with_cost_estimate().estimated);
        let zero_cost = UsageRecord {
            cost_usd: Some(0.0),
            ..UsageRecord::default()
        };
        assert_eq!(zero_cost.with_cost_estimate(), zero_cost);
    }

    #[test]
    fn accumulate_sums_tokens_and_costs() {
        let mut total = UsageRecord {
            input_tokens: 100,
            output_tokens: 50,
            cost_usd: Some(0.5),
            ..UsageRecord::default()
        };
        total.accumulate(&UsageRecord {
            input_tokens: 200,
            output_tokens: 75,
            cache_read_tokens: 10,
            cost_usd: Some(0.25),
            ..UsageRecord::default()
        });
        assert_eq!(total.input_tokens, 300);
        assert_eq!(total.output_tokens, 125);
        assert_eq!(total.cache_read_tokens, 10);
        assert_eq!(total.cost_usd, Some(0.75));
    }
}
