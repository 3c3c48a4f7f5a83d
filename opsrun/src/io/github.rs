//! GitHub CLI (`gh`) adapter.

use std::path::PathBuf;

use tracing::{info, instrument};

use crate::core::backoff::RetryPolicy;
use crate::io::process::ProcessEnv;
use crate::io::tool::{CommandError, Tool};
use crate::retry::{self, RetryError, Sleeper, ThreadSleeper};

/// Parameters for `gh pr create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub title: String,
    pub body: String,
    /// Target branch. The repository default when `None`.
    pub base: Option<String>,
    /// Source branch. The current branch when `None`.
    pub head: Option<String>,
    pub draft: bool,
}

impl PullRequest {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: String::new(),
            base: None,
            head: None,
            draft: false,
        }
    }

    fn args(&self) -> Vec<&str> {
        let mut args = vec![
            "pr",
            "create",
            "--title",
            self.title.as_str(),
            "--body",
            self.body.as_str(),
        ];
        if let Some(base) = &self.base {
            args.extend(["--base", base.as_str()]);
        }
        if let Some(head) = &self.head {
            args.extend(["--head", head.as_str()]);
        }
        if self.draft {
            args.push("--draft");
        }
        args
    }
}

#[derive(Debug, Clone)]
pub struct GitHub {
    tool: Tool,
    policy: RetryPolicy,
}

impl GitHub {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self::with_program("gh", workdir)
    }

    /// Use a different executable in place of `gh`.
    pub fn with_program(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            tool: Tool::new(program, workdir),
            policy: RetryPolicy::default(),
        }
    }

    /// Invoke `gh` through a wrapper command (`program leading_args... pr create ...`).
    pub fn with_wrapper<I, S>(
        program: impl Into<String>,
        leading_args: I,
        workdir: impl Into<PathBuf>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tool: Tool::new(program, workdir).with_leading_args(leading_args),
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

    /// True when `gh auth status` succeeds.
    pub fn is_authenticated(&self) -> Result<bool, CommandError> {
        self.tool.run_status(&["auth", "status"])
    }

    /// Open a pull request and return its URL.
    pub fn create_pull_request(
        &self,
        pr: &PullRequest,
    ) -> Result<String, RetryError<CommandError>> {
        self.create_pull_request_with(pr, &ThreadSleeper)
    }

    #[instrument(skip_all, fields(title = %pr.title))]
    pub fn create_pull_request_with<S: Sleeper + ?Sized>(
        &self,
        pr: &PullRequest,
        sleeper: &S,
    ) -> Result<String, RetryError<CommandError>> {
        let args = pr.args();
        let stdout = retry::execute_with(|| self.tool.run_checked(&args), &self.policy, sleeper)?;
        // gh prints progress chatter before the URL.
        let url = stdout.lines().last().unwrap_or_default().trim().to_string();
        info!(%url, "pull request created");
        Ok(url)
    }
}
