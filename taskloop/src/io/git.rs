//! Git adapter for working-tree verification.
//!
//! The loop only needs to ask "is the tree clean apart from our own files?",
//! so this stays a small, explicit wrapper around `git` subprocess calls.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument};

/// One line of `git status --porcelain=v1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// XY status code; `??` for untracked files.
    pub code: String,
    /// Path relative to the repository root (the new path for renames).
    pub path: String,
}

impl StatusEntry {
    fn parse(line: &str) -> Result<Self> {
        let (code, rest) = match (line.get(..2), line.get(3..)) {
            (Some(code), Some(rest)) if !rest.trim().is_empty() => (code, rest),
            _ => bail!("unexpected porcelain line: '{line}'"),
        };
        let path = match rest.split_once(" -> ") {
            Some((_, renamed)) => renamed,
            None => rest,
        };
        Ok(Self {
            code: code.to_string(),
            path: path.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn init(&self) -> Result<()> {
        self.stdout(&["init", "--quiet"]).map(drop)
    }

    /// Changed or untracked files outside `allowed_prefixes`.
    ///
    /// Untracked directories are expanded (`-uall`) so prefixes match files.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn dirty_entries_except(&self, allowed_prefixes: &[&str]) -> Result<Vec<StatusEntry>> {
        let out = self.stdout(&["status", "--porcelain=v1", "-uall"])?;
        let mut dirty = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let entry = StatusEntry::parse(line)?;
            if allowed_prefixes.iter().any(|p| entry.path.starts_with(p)) {
                continue;
            }
            dirty.push(entry);
        }
        debug!(dirty = dirty.len(), "working tree status");
        Ok(dirty)
    }

    /// Stage everything, honoring `.gitignore`.
    pub fn add_all(&self) -> Result<()> {
        self.stdout(&["add", "-A"]).map(drop)
    }

    /// Commit whatever is staged under a fixed local identity.
    ///
    /// Returns `false` without committing when nothing is staged.
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        let staged = self.stdout(&["diff", "--cached", "--name-only"])?;
        if staged.trim().is_empty() {
            return Ok(false);
        }
        self.stdout(&[
            "-c",
            "user.name=taskloop",
            "-c",
            "user.email=taskloop@localhost",
            "commit",
            "--quiet",
            "-m",
            message,
        ])?;
        Ok(true)
    }

    fn stdout(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Human-readable listing used in verification failures.
pub fn describe_dirty(entries: &[StatusEntry]) -> String {
    let listing: Vec<String> = entries
        .iter()
        .map(|e| format!("{} {}", e.code, e.path))
        .collect();
    format!("working tree not clean:\n{}", listing.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_porcelain_lines() {
        let untracked = StatusEntry::parse("?? notes.txt").expect("parse");
        assert_eq!(
            untracked,
            StatusEntry {
                code: "??".to_string(),
                path: "notes.txt".to_string()
            }
        );
        let modified = StatusEntry::parse(" M src/main.rs").expect("parse");
        assert_eq!(modified.code, " M");
        assert_eq!(modified.path, "src/main.rs");
        let renamed = StatusEntry::parse("R  old.txt -> new.txt").expect("parse");
        assert_eq!(renamed.path, "new.txt");
        assert!(StatusEntry::parse("M").is_err());
    }

    #[test]
    fn allowed_prefixes_are_ignored() {
        let repo = TestRepo::new().expect("repo");
        repo.write_file(".taskloop/tasks.json", "{}").expect("write");
        repo.write_file("src/lib.rs", "// changed").expect("write");

        let git = Git::new(repo.root());
        let dirty = git.dirty_entries_except(&[".taskloop/"]).expect("status");
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].path, "src/lib.rs");
        assert_eq!(describe_dirty(&dirty), "working tree not clean:\n?? src/lib.rs");

        git.add_all().expect("add");
        assert!(git.commit_staged("work").expect("commit"));
        assert!(git.dirty_entries_except(&[]).expect("status").is_empty());
        assert!(!git.commit_staged("nothing").expect("commit"));
    }
}
