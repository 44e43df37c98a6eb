//! Git worktree enumeration for the state snapshot.

use serde::Serialize;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Worktree {
    pub path: String,
    pub head: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// List the worktrees under `root`. Failures (no git, not a repo)
/// degrade to an empty list; the snapshot still goes out.
pub async fn list_worktrees(root: &Path) -> Vec<Worktree> {
    let output = Command::new("git")
        .args(["worktree", "list", "--porcelain"])
        .current_dir(root)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => {
            parse_porcelain(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(out) => {
            debug!(root = %root.display(), status = %out.status, "git worktree list failed");
            Vec::new()
        }
        Err(e) => {
            debug!(root = %root.display(), error = %e, "git not runnable");
            Vec::new()
        }
    }
}

/// Parse `git worktree list --porcelain` output: blank-line separated
/// blocks of `worktree <path>` / `HEAD <sha>` / `branch <ref>` lines.
fn parse_porcelain(raw: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    let mut path: Option<String> = None;
    let mut head = String::new();
    let mut branch: Option<String> = None;

    let mut flush = |path: &mut Option<String>, head: &mut String, branch: &mut Option<String>| {
        if let Some(p) = path.take() {
            worktrees.push(Worktree {
                path: p,
                head: std::mem::take(head),
                branch: branch.take(),
            });
        }
    };

    for line in raw.lines() {
        if line.is_empty() {
            flush(&mut path, &mut head, &mut branch);
        } else if let Some(p) = line.strip_prefix("worktree ") {
            flush(&mut path, &mut head, &mut branch);
            path = Some(p.to_string());
        } else if let Some(h) = line.strip_prefix("HEAD ") {
            head = h.to_string();
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = Some(b.to_string());
        }
    }
    flush(&mut path, &mut head, &mut branch);
    worktrees
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_porcelain_blocks() {
        let raw = "\
worktree /work/main
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /work/feature
HEAD 2222222222222222222222222222222222222222
branch refs/heads/feature-x

worktree /work/detached
HEAD 3333333333333333333333333333333333333333
detached
";
        let parsed = parse_porcelain(raw);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].path, "/work/main");
        assert_eq!(parsed[0].branch.as_deref(), Some("refs/heads/main"));
        assert_eq!(parsed[2].path, "/work/detached");
        assert!(parsed[2].branch.is_none());
    }

    #[test]
    fn empty_output_parses_to_nothing() {
        assert!(parse_porcelain("").is_empty());
    }
}
