//! Typed failures the CLI maps to exit codes and remediation hints.
//!
//! Everything else travels as `anyhow::Error` with context; these types are
//! recovered with `downcast_ref` at the command boundary.

use thiserror::Error;

/// Malformed backlog: every issue found, in deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task store validation failed:\n- {}", issues.join("\n- "))]
pub struct ValidationError {
    pub issues: Vec<String>,
}

/// Harness exited non-zero (or timed out) while working on a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("harness '{harness}' failed on task '{task_id}' with exit code {exit_code}{}", if *timed_out { " (timed out)" } else { "" })]
pub struct InvocationError {
    pub harness: String,
    pub task_id: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Post-invocation verification failed under the strict policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("state verification failed after task '{task_id}': {reason}")]
pub struct StateVerificationFailure {
    pub task_id: String,
    pub reason: String,
}

/// Illegal status change requested on a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),
    #[error("task '{id}' cannot move from {from} to {to}")]
    Illegal {
        id: String,
        from: crate::core::types::TaskStatus,
        to: crate::core::types::TaskStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_issue() {
        let err = ValidationError {
            issues: vec!["duplicate id 'a'".to_string(), "task 'b': unknown dependency 'z'".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("- duplicate id 'a'"));
        assert!(msg.contains("- task 'b': unknown dependency 'z'"));
    }

    #[test]
    fn invocation_error_mentions_timeout() {
        let err = InvocationError {
            harness: "claude".to_string(),
            task_id: "t1".to_string(),
            exit_code: 124,
            timed_out: true,
        };
        assert_eq!(
            err.to_string(),
            "harness 'claude' failed on task 't1' with exit code 124 (timed out)"
        );
    }
}
