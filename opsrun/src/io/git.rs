//! Git adapter.
//!
//! Local operations run once. Network operations (`fetch`, `pull`, `push`)
//! run under the retry executor, since they are the ones that fail
//! transiently.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::RetryPolicy;
use crate::io::process::ProcessEnv;
use crate::io::tool::{CommandError, Tool};
use crate::retry::{self, RetryError, Sleeper, ThreadSleeper};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    tool: Tool,
    policy: RetryPolicy,
}

/// What `sync` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub branch: String,
    /// Whether a new commit was created from local changes.
    pub committed: bool,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            tool: Tool::new("git", workdir),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_env(mut self, env: &ProcessEnv) -> Self {
        self.tool = self.tool.with_env(env);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn workdir(&self) -> &Path {
        self.tool.workdir()
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let name = self.tool.run_checked(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        Ok(self.tool.run_checked(&["rev-parse", &arg, "HEAD"])?)
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.tool.run_checked(&["add", "-A"])?;
        Ok(())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        // `--quiet` exits 1 when there are differences.
        Ok(!self.tool.run_status(&["diff", "--cached", "--quiet"])?)
    }

    /// Commit staged changes. Returns `Ok(false)` and does nothing when nothing is staged.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.tool.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    pub fn fetch(&self, remote: &str) -> Result<(), RetryError<CommandError>> {
        self.fetch_with(remote, &ThreadSleeper)
    }

    #[instrument(skip_all, fields(remote))]
    pub fn fetch_with<S: Sleeper + ?Sized>(
        &self,
        remote: &str,
        sleeper: &S,
    ) -> Result<(), RetryError<CommandError>> {
        self.retried(&["fetch", "--prune", remote], sleeper)
    }

    /// `git pull --rebase <remote> <branch>`.
    pub fn pull(&self, remote: &str, branch: &str) -> Result<(), RetryError<CommandError>> {
        self.pull_with(remote, branch, &ThreadSleeper)
    }

    #[instrument(skip_all, fields(remote, branch))]
    pub fn pull_with<S: Sleeper + ?Sized>(
        &self,
        remote: &str,
        branch: &str,
        sleeper: &S,
    ) -> Result<(), RetryError<CommandError>> {
        self.retried(&["pull", "--rebase", remote, branch], sleeper)
    }

    /// `git push [-u] <remote> <branch>`.
    pub fn push(
        &self,
        remote: &str,
        branch: &str,
        set_upstream: bool,
    ) -> Result<(), RetryError<CommandError>> {
        self.push_with(remote, branch, set_upstream, &ThreadSleeper)
    }

    #[instrument(skip_all, fields(remote, branch, set_upstream))]
    pub fn push_with<S: Sleeper + ?Sized>(
        &self,
        remote: &str,
        branch: &str,
        set_upstream: bool,
        sleeper: &S,
    ) -> Result<(), RetryError<CommandError>> {
        let mut args = vec!["push"];
        if set_upstream {
            args.push("-u");
        }
        args.extend([remote, branch]);
        self.retried(&args, sleeper)
    }

    /// Stage everything, commit if anything changed, rebase onto the remote, push.
    #[instrument(skip_all, fields(remote))]
    pub fn sync(&self, remote: &str, message: &str) -> Result<SyncOutcome> {
        let branch = self.current_branch()?;
        self.add_all()?;
        let committed = self.commit_staged(message)?;
        self.pull(remote, &branch)?;
        self.push(remote, &branch, false)?;
        info!(%branch, committed, "sync complete");
        Ok(SyncOutcome { branch, committed })
    }

    fn retried<S: Sleeper + ?Sized>(
        &self,
        args: &[&str],
        sleeper: &S,
    ) -> Result<(), RetryError<CommandError>> {
        retry::execute_with(|| self.tool.run_checked(args), &self.policy, sleeper)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{Classify, ErrorKind};
    use crate::test_support::{RecordingSleeper, TestRepo};
    use std::time::Duration;

    fn git_for(repo: &TestRepo) -> Git {
        Git::new(repo.path()).with_env(
            &ProcessEnv::new()
                .with("GIT_AUTHOR_NAME", "opsrun-test")
                .with("GIT_AUTHOR_EMAIL", "opsrun-test@example.com")
                .with("GIT_COMMITTER_NAME", "opsrun-test")
                .with("GIT_COMMITTER_EMAIL", "opsrun-test@example.com"),
        )
    }

    #[test]
    fn reports_current_branch() {
        let repo = TestRepo::new().expect("repo");
        assert_eq!(git_for(&repo).current_branch().expect("branch"), "main");
    }

    #[test]
    fn commit_staged_skips_when_clean() {
        let repo = TestRepo::new().expect("repo");
        let git = git_for(&repo);
        git.add_all().expect("add");
        assert!(!git.commit_staged("nothing").expect("commit"));
    }

    #[test]
    fn sync_commits_and_pushes_local_changes() {
        let repo = TestRepo::new().expect("repo");
        std::fs::write(repo.path().join("new.txt"), "hi\n").expect("write");
        let git = git_for(&repo);

        let outcome = git.sync("origin", "chore: add new.txt").expect("sync");

        assert_eq!(
            outcome,
            SyncOutcome {
                branch: "main".to_string(),
                committed: true
            }
        );
        assert_eq!(
            repo.origin_main_sha().expect("origin sha"),
            repo.head_sha().expect("head sha")
        );
    }

    #[test]
    fn push_to_missing_remote_is_not_retried() {
        let repo = TestRepo::new().expect("repo");
        let sleeper = RecordingSleeper::default();
        let git = git_for(&repo).with_retry_policy(
            RetryPolicy::new(3, Duration::from_secs(1), ErrorKind::DEFAULT_TRANSIENT)
                .expect("policy"),
        );

        let err = git
            .push_with("nowhere", "main", false, &sleeper)
            .unwrap_err();

        assert!(sleeper.recorded().is_empty());
        assert_ne!(err.kind(), ErrorKind::TransientIo);
        assert_eq!(err.attempts(), Some(1));
    }

    #[test]
    fn push_updates_origin_head() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("c.txt", "c\n", "add c").expect("commit");
        let git = git_for(&repo);

        git.push("origin", "main", false).expect("push");

        let origin = Git::new(repo.origin());
        assert_eq!(
            origin.head_short_sha(12).expect("origin head"),
            git.head_short_sha(12).expect("work head")
        );
    }

    #[test]
    fn fetch_from_origin_succeeds() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("b.txt", "b\n", "add b").expect("commit");
        git_for(&repo).fetch("origin").expect("fetch");
    }
}
