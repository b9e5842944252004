//! Git context capture via libgit2 (git2 crate).
//!
//! Read-only: opens the repo fresh per call, pulls the current branch, the
//! last N commits, and the changed files, and folds them into a session's
//! structured context. No shell-outs.

use std::path::Path;

use mx_core::types::SessionContext;
use serde::{Deserialize, Serialize};

use crate::IntegrationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitContext {
    pub branch: String,
    /// `"<short-sha> <summary>"` strings, newest first.
    pub commits: Vec<String>,
    pub files_changed: Vec<String>,
}

impl GitContext {
    /// Merge this capture into a session's structured context.
    pub fn apply(self, context: &mut SessionContext) {
        context.git_commits = self.commits;
        context.files_changed = self.files_changed;
    }
}

/// Capture branch, recent commits, and working-tree changes for a workspace.
pub fn capture(workdir: &Path, max_commits: usize) -> Result<GitContext, IntegrationError> {
    let repo = git2::Repository::discover(workdir)?;

    let branch = match repo.head() {
        Ok(head) if head.is_branch() => head.shorthand().unwrap_or("HEAD").to_string(),
        Ok(head) => head
            .target()
            .map(|oid| format!("{:.7}", oid))
            .unwrap_or_else(|| "HEAD".to_string()),
        // Unborn branch (fresh repo, no commits yet).
        Err(_) => "HEAD".to_string(),
    };

    let mut commits = Vec::new();
    if let Ok(mut revwalk) = repo.revwalk() {
        if revwalk.push_head().is_ok() {
            for oid in revwalk.flatten().take(max_commits) {
                if let Ok(commit) = repo.find_commit(oid) {
                    commits.push(format!(
                        "{:.7} {}",
                        oid,
                        commit.summary().unwrap_or("<no summary>")
                    ));
                }
            }
        }
    }

    let mut opts = git2::StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    let files_changed = statuses
        .iter()
        .filter_map(|entry| entry.path().map(|p| p.to_string()))
        .collect();

    Ok(GitContext {
        branch,
        commits,
        files_changed,
    })
}

/// Whether the path is inside a git worktree at all.
pub fn is_repo(workdir: &Path) -> bool {
    git2::Repository::discover(workdir).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_repo() -> (tempfile::TempDir, git2::Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    fn commit_file(repo: &git2::Repository, name: &str, message: &str) {
        let workdir = repo.workdir().unwrap();
        std::fs::write(workdir.join(name), "content").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("tester", "tester@example.com").unwrap();
        let parent = repo
            .head()
            .ok()
            .and_then(|h| h.target())
            .and_then(|oid| repo.find_commit(oid).ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap();
    }

    #[test]
    fn capture_reads_branch_commits_and_changes() {
        let (dir, repo) = scratch_repo();
        commit_file(&repo, "a.txt", "first commit");
        commit_file(&repo, "b.txt", "second commit");
        // Untracked file shows up in files_changed.
        std::fs::write(dir.path().join("dirty.txt"), "wip").unwrap();

        let ctx = capture(dir.path(), 10).unwrap();
        assert_eq!(ctx.commits.len(), 2);
        assert!(ctx.commits[0].contains("second commit"));
        assert!(ctx.commits[1].contains("first commit"));
        assert!(ctx.files_changed.iter().any(|f| f == "dirty.txt"));
        assert!(!ctx.branch.is_empty());
    }

    #[test]
    fn capture_handles_empty_repo() {
        let (dir, _repo) = scratch_repo();
        let ctx = capture(dir.path(), 10).unwrap();
        assert!(ctx.commits.is_empty());
        assert_eq!(ctx.branch, "HEAD");
    }

    #[test]
    fn apply_fills_session_context() {
        let ctx = GitContext {
            branch: "main".into(),
            commits: vec!["abc1234 fix".into()],
            files_changed: vec!["src/lib.rs".into()],
        };
        let mut session_ctx = SessionContext::default();
        ctx.apply(&mut session_ctx);
        assert_eq!(session_ctx.git_commits, vec!["abc1234 fix".to_string()]);
        assert_eq!(session_ctx.files_changed, vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn is_repo_detection() {
        let (dir, _repo) = scratch_repo();
        assert!(is_repo(dir.path()));
        let plain = tempfile::tempdir().unwrap();
        assert!(!is_repo(plain.path()));
    }
}
