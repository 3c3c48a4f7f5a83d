//! `opsrun`: run step plans, docker cleanup and git/GitHub operations with
//! retries, streaming output, and cooperative cancellation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use opsrun::cancel::CancellationSignal;
use opsrun::core::docker::{CleanupOptions, cleanup_steps};
use opsrun::core::types::{ExecutionResult, StepSpec};
use opsrun::exit_codes;
use opsrun::io::config::{DEFAULT_CONFIG_FILE, OpsConfig, load_config, write_config};
use opsrun::io::git::Git;
use opsrun::io::github::{GitHub, PullRequest};
use opsrun::io::plan::load_plan;
use opsrun::logging;
use opsrun::pipeline::run_steps;

#[derive(Parser)]
#[command(
    name = "opsrun",
    version,
    about = "Run command pipelines and flaky network operations with retries and cancellation"
)]
struct Cli {
    /// Config file. Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the steps listed in a plan file, in order, stopping at the first failure.
    Run {
        plan: PathBuf,
        #[command(flatten)]
        output: RunArgs,
    },
    /// Prune stopped containers, unused images and build cache.
    DockerCleanup {
        /// Remove all unused images, not only dangling ones.
        #[arg(long)]
        all_images: bool,
        /// Also remove unused volumes.
        #[arg(long)]
        volumes: bool,
        #[command(flatten)]
        output: RunArgs,
    },
    /// Git network operations with retry on transient failures.
    Git {
        /// Repository directory.
        #[arg(short = 'C', long = "dir", default_value = ".")]
        dir: PathBuf,
        #[command(subcommand)]
        action: GitAction,
    },
    /// GitHub CLI operations with retry on transient failures.
    Gh {
        /// Repository directory.
        #[arg(short = 'C', long = "dir", default_value = ".")]
        dir: PathBuf,
        #[command(subcommand)]
        action: GhAction,
    },
    /// Inspect or create the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Print the final result as JSON on stdout; live output goes to stderr.
    #[arg(long)]
    json: bool,
    /// Cancel the run after this many seconds.
    #[arg(long, value_name = "SECS", value_parser = parse_secs)]
    cancel_after: Option<Duration>,
}

#[derive(Subcommand)]
enum GitAction {
    Push {
        #[arg(long, default_value = "origin")]
        remote: String,
        /// Defaults to the current branch.
        #[arg(long)]
        branch: Option<String>,
        #[arg(short = 'u', long)]
        set_upstream: bool,
    },
    Pull {
        #[arg(long, default_value = "origin")]
        remote: String,
        /// Defaults to the current branch.
        #[arg(long)]
        branch: Option<String>,
    },
    Fetch {
        #[arg(long, default_value = "origin")]
        remote: String,
    },
    /// Stage everything, commit if needed, pull --rebase, push.
    Sync {
        #[arg(short, long)]
        message: String,
        #[arg(long, default_value = "origin")]
        remote: String,
    },
}

#[derive(Subcommand)]
enum GhAction {
    /// Open a pull request and print its URL.
    PrCreate {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long)]
        base: Option<String>,
        #[arg(long)]
        head: Option<String>,
        #[arg(long)]
        draft: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config as TOML.
    Show,
    /// Write the default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn parse_secs(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw.parse().map_err(|err| format!("{err}"))?;
    Duration::try_from_secs_f64(secs).map_err(|err| format!("{err}"))
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = || load_config(&cli.config);
    match cli.command {
        Command::Run { plan, output } => {
            let cfg = config()?;
            let steps = load_plan(&plan)?;
            Ok(run_pipeline(&cfg, &steps, &output))
        }
        Command::DockerCleanup {
            all_images,
            volumes,
            output,
        } => {
            let cfg = config()?;
            let steps = cleanup_steps(CleanupOptions {
                all_images,
                volumes,
            });
            Ok(run_pipeline(&cfg, &steps, &output))
        }
        Command::Git { dir, action } => cmd_git(&config()?, &dir, action),
        Command::Gh { dir, action } => cmd_gh(&config()?, &dir, action),
        Command::Config { action } => cmd_config(&cli.config, action),
    }
}

fn run_pipeline(cfg: &OpsConfig, steps: &[StepSpec], args: &RunArgs) -> i32 {
    let cancel = CancellationSignal::new();
    if let Some(after) = args.cancel_after {
        debug!(after_ms = after.as_millis() as u64, "arming cancel deadline");
        // The watchdog is detached; process exit ends it.
        let _ = cancel.cancel_after(after);
    }

    let json = args.json;
    let mut sink = |line: &str| {
        if json {
            eprintln!("{line}");
        } else {
            let mut stdout = std::io::stdout().lock();
            // A closed stdout (e.g. `| head`) must not abort the run.
            let _ = writeln!(stdout, "{line}");
            let _ = stdout.flush();
        }
    };
    let result = run_steps(steps, &mut sink, &cancel, &cfg.pipeline_options());

    if json {
        match serde_json::to_string_pretty(&result) {
            Ok(payload) => println!("{payload}"),
            Err(err) => eprintln!("serialize result: {err}"),
        }
    }
    cli_exit_code(&result)
}

fn cli_exit_code(result: &ExecutionResult) -> i32 {
    if result.cancelled {
        exit_codes::CANCELLED
    } else if result.success() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    }
}

fn cmd_git(cfg: &OpsConfig, dir: &Path, action: GitAction) -> Result<i32> {
    let git = Git::new(dir)
        .with_env(&cfg.env)
        .with_retry_policy(cfg.retry_policy()?);
    let branch_or_current = |branch: Option<String>| match branch {
        Some(branch) => Ok(branch),
        None => git.current_branch(),
    };

    match action {
        GitAction::Push {
            remote,
            branch,
            set_upstream,
        } => {
            let branch = branch_or_current(branch)?;
            git.push(&remote, &branch, set_upstream)
                .with_context(|| format!("push {branch} to {remote}"))?;
            println!("pushed {branch} to {remote}");
        }
        GitAction::Pull { remote, branch } => {
            let branch = branch_or_current(branch)?;
            git.pull(&remote, &branch)
                .with_context(|| format!("pull {branch} from {remote}"))?;
            println!("pulled {branch} from {remote}");
        }
        GitAction::Fetch { remote } => {
            git.fetch(&remote)
                .with_context(|| format!("fetch {remote}"))?;
            println!("fetched {remote}");
        }
        GitAction::Sync { message, remote } => {
            let outcome = git.sync(&remote, &message)?;
            println!(
                "synced {} with {remote} (committed: {})",
                outcome.branch, outcome.committed
            );
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_gh(cfg: &OpsConfig, dir: &Path, action: GhAction) -> Result<i32> {
    let gh = GitHub::new(dir)
        .with_env(&cfg.env)
        .with_retry_policy(cfg.retry_policy()?);
    match action {
        GhAction::PrCreate {
            title,
            body,
            base,
            head,
            draft,
        } => {
            let pr = PullRequest {
                title,
                body,
                base,
                head,
                draft,
            };
            let url = gh.create_pull_request(&pr).context("create pull request")?;
            println!("{url}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_config(path: &Path, action: ConfigAction) -> Result<i32> {
    match action {
        ConfigAction::Show => {
            let cfg = load_config(path)?;
            let rendered = toml::to_string_pretty(&cfg).context("serialize config toml")?;
            print!("{rendered}");
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            write_config(path, &OpsConfig::default())?;
            println!("wrote {}", path.display());
        }
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "opsrun",
            "run",
            "plan.toml",
            "--json",
            "--cancel-after",
            "1.5",
        ]);
        match cli.command {
            Command::Run { plan, output } => {
                assert_eq!(plan, PathBuf::from("plan.toml"));
                assert!(output.json);
                assert_eq!(output.cancel_after, Some(Duration::from_millis(1500)));
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn cancel_after_rejects_unrepresentable_durations() {
        for raw in ["inf", "1e30", "-1", "NaN", "soon"] {
            let parsed = Cli::try_parse_from(["opsrun", "run", "plan.toml", "--cancel-after", raw]);
            assert!(parsed.is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn parse_docker_cleanup_flags() {
        let cli = Cli::parse_from(["opsrun", "docker-cleanup", "--volumes"]);
        assert!(matches!(
            cli.command,
            Command::DockerCleanup {
                all_images: false,
                volumes: true,
                ..
            }
        ));
    }

    #[test]
    fn parse_git_push_defaults() {
        let cli = Cli::parse_from(["opsrun", "git", "-C", "repo", "push", "-u"]);
        match cli.command {
            Command::Git {
                dir,
                action:
                    GitAction::Push {
                        remote,
                        branch,
                        set_upstream,
                    },
            } => {
                assert_eq!(dir, PathBuf::from("repo"));
                assert_eq!(remote, "origin");
                assert_eq!(branch, None);
                assert!(set_upstream);
            }
            _ => panic!("expected git push"),
        }
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::parse_from(["opsrun", "config", "show", "--config", "custom.toml"]);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
    }

    #[test]
    fn exit_code_maps_result_state() {
        let mut result = ExecutionResult {
            exit_code: 0,
            transcript: Vec::new(),
            failed_step_label: None,
            cancelled: false,
            steps_run: Vec::new(),
        };
        assert_eq!(cli_exit_code(&result), exit_codes::OK);
        result.exit_code = 7;
        assert_eq!(cli_exit_code(&result), exit_codes::FAILED);
        result.exit_code = exit_codes::CANCELLED;
        result.cancelled = true;
        assert_eq!(cli_exit_code(&result), exit_codes::CANCELLED);
    }
}
