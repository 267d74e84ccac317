//! `mention-bot` command line entry point.

mod pid_file;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mention_runtime::{BotConfig, GithubApiClient, HostingApi, MentionBot, RepoRef};
use mention_store::{ItemKind, MentionMatcher, SqliteMentionStore};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mention-bot",
    about = "Polls a GitHub repository for assistant mentions and dispatches them to a local assistant CLI",
    version
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: BotCommand,
}

#[derive(Debug, clap::Args)]
struct ConfigArgs {
    /// GitHub token used for api calls.
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,
    /// Repository under watch, as owner/name.
    #[arg(long, env = "GITHUB_REPOSITORY")]
    repo: Option<String>,
    #[arg(long, env = "GITHUB_API_URL", default_value = "https://api.github.com")]
    api_base: String,
    /// Comma-separated mention substrings, matched case-insensitively.
    #[arg(long, env = "MENTION_PATTERNS", default_value = "@claude,@claude-code")]
    mention_patterns: String,
    /// Five-field cron expression for detection cycles (UTC).
    #[arg(long, env = "DETECTION_CRON", default_value = "*/5 * * * *")]
    detection_cron: String,
    /// Five-field cron expression for database backups (UTC).
    #[arg(long, env = "BACKUP_CRON", default_value = "0 2 * * *")]
    backup_cron: String,
    #[arg(long, env = "MENTION_DB_PATH", default_value = "mention_tracker.db")]
    db_path: PathBuf,
    #[arg(long, env = "BACKUP_DIR", default_value = "backups")]
    backup_dir: PathBuf,
    #[arg(long, env = "BACKUP_RETENTION_DAYS", default_value_t = 7)]
    backup_retention_days: u32,
    /// In-flight dispatch ceiling, 1..=10.
    #[arg(long, env = "MAX_CONCURRENT_MENTIONS", default_value_t = 3)]
    max_concurrent: usize,
    /// Estimated-token spend allowed per UTC day.
    #[arg(long, env = "DAILY_TOKEN_LIMIT", default_value_t = 45_000)]
    daily_token_limit: u64,
    /// Assistant CLI executable name or path.
    #[arg(long, env = "CLAUDE_CLI_PATH", default_value = "claude")]
    assistant_executable: String,
    #[arg(long, env = "CLAUDE_API_KEY", hide_env_values = true)]
    assistant_api_key: Option<String>,
    /// Directory the assistant subprocess runs in.
    #[arg(long, env = "TARGET_PROJECT_DIR", default_value = ".")]
    workspace_dir: PathBuf,
    /// Directory of prompt template overrides.
    #[arg(long, env = "PROMPT_TEMPLATE_DIR")]
    template_dir: Option<PathBuf>,
    /// Pause between dispatched mentions, in milliseconds.
    #[arg(long, env = "DISPATCH_DELAY_MS", default_value_t = 2_000)]
    dispatch_delay_ms: u64,
    /// Assistant subprocess wall-clock limit, in milliseconds.
    #[arg(long, env = "ASSISTANT_TIMEOUT_MS", default_value_t = 300_000)]
    assistant_timeout_ms: u64,
    #[arg(long, env = "GITHUB_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,
    #[arg(long, env = "GITHUB_RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    retry_max_attempts: usize,
    #[arg(long, env = "GITHUB_RETRY_BASE_DELAY_MS", default_value_t = 500)]
    retry_base_delay_ms: u64,
    #[arg(long, env = "MENTION_BOT_PID_FILE", default_value = "mention-bot.pid")]
    pid_file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum BotCommand {
    /// Run the daemon in the foreground on the configured schedules.
    Start,
    /// Stop a running daemon via its pid file.
    Stop,
    /// Print a JSON status snapshot.
    Status,
    /// Run a single detect-and-dispatch cycle and exit.
    RunOnce,
    /// Write the default prompt templates into a directory for editing.
    Setup {
        /// Target directory; defaults to ./templates.
        #[arg(long, default_value = "templates")]
        dir: PathBuf,
    },
}

impl ConfigArgs {
    fn patterns(&self) -> Vec<String> {
        self.mention_patterns
            .split(',')
            .map(|pattern| pattern.trim().to_string())
            .filter(|pattern| !pattern.is_empty())
            .collect()
    }

    fn bot_config(&self) -> Result<BotConfig> {
        let github_token = self
            .github_token
            .clone()
            .context("github token is required (--github-token or GITHUB_TOKEN)")?;
        let repo = self
            .repo
            .as_deref()
            .context("repository is required (--repo or GITHUB_REPOSITORY)")?;
        BotConfig {
            github_token,
            repo: RepoRef::parse(repo)?,
            api_base: self.api_base.clone(),
            mention_patterns: self.patterns(),
            detection_cron: self.detection_cron.clone(),
            backup_cron: self.backup_cron.clone(),
            db_path: self.db_path.clone(),
            backup_dir: self.backup_dir.clone(),
            backup_retention_days: self.backup_retention_days,
            max_concurrent: self.max_concurrent,
            daily_token_limit: self.daily_token_limit,
            assistant_executable: self.assistant_executable.clone(),
            assistant_api_key: self.assistant_api_key.clone(),
            workspace_dir: self.workspace_dir.clone(),
            template_dir: self.template_dir.clone(),
            dispatch_delay_ms: self.dispatch_delay_ms,
            assistant_timeout_ms: self.assistant_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
            retry_max_attempts: self.retry_max_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
            pid_file: self.pid_file.clone(),
        }
        .normalized()
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        BotCommand::Start => run_daemon(&cli.config).await,
        BotCommand::Stop => {
            let stopped = pid_file::stop_process(&cli.config.pid_file, Duration::from_secs(10))?;
            if stopped {
                println!("stopped");
            } else {
                println!("not running");
            }
            Ok(())
        }
        BotCommand::Status => print_status(&cli.config),
        BotCommand::RunOnce => run_once(&cli.config).await,
        BotCommand::Setup { dir } => setup(&cli.config, &dir).await,
    }
}

/// Prepares a working installation: store schema, backup directory,
/// editable prompt templates, and (when credentials are present) a
/// connectivity check against the repository.
async fn setup(args: &ConfigArgs, dir: &std::path::Path) -> Result<()> {
    SqliteMentionStore::new(&args.db_path, MentionMatcher::new(args.patterns()))?;
    println!("store   {}", args.db_path.display());

    std::fs::create_dir_all(&args.backup_dir).with_context(|| {
        format!("failed to create backup directory {}", args.backup_dir.display())
    })?;
    println!("backups {}", args.backup_dir.display());

    setup_templates(dir)?;

    if let (Some(token), Some(repo)) = (&args.github_token, &args.repo) {
        let client = GithubApiClient::new(
            args.api_base.clone(),
            token.clone(),
            RepoRef::parse(repo)?,
            args.request_timeout_ms,
            args.retry_max_attempts,
            args.retry_base_delay_ms,
        )?;
        let repository = client.get_repository().await?;
        println!("github  {} reachable", repository.full_name);
    } else {
        println!("github  skipped (set GITHUB_TOKEN and GITHUB_REPOSITORY to verify)");
    }
    Ok(())
}

async fn run_daemon(args: &ConfigArgs) -> Result<()> {
    let config = args.bot_config()?;
    pid_file::write_pid_file(&config.pid_file)?;

    let bot = MentionBot::new(config.clone())?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = bot.run_until(shutdown_rx).await;
    pid_file::remove_pid_file(&config.pid_file);
    result
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            tracing::error!(error = %error, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("shutdown signal received");
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

async fn run_once(args: &ConfigArgs) -> Result<()> {
    let config = args.bot_config()?;
    let bot = MentionBot::new(config)?;
    let outcome = bot.run_once().await?;
    let summary = serde_json::json!({
        "skipped": outcome.skipped,
        "new_mentions": outcome.new_mentions,
        "backlog_mentions": outcome.backlog_mentions,
        "attempted": outcome.report.attempted,
        "succeeded": outcome.report.succeeded,
        "failed": outcome.report.failed,
        "skipped_over_budget": outcome.report.skipped_over_budget,
        "skipped_at_ceiling": outcome.report.skipped_at_ceiling,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Status reads the pid file and the database directly, so it works from a
/// separate process while the daemon is running.
fn print_status(args: &ConfigArgs) -> Result<()> {
    let pid = pid_file::read_pid(&args.pid_file)?;
    let running = pid.map(pid_file::is_process_alive).unwrap_or(false);

    let mut status = serde_json::json!({
        "running": running,
        "pid": if running { pid } else { None },
        "db_path": args.db_path.display().to_string(),
    });

    if args.db_path.exists() {
        let store =
            SqliteMentionStore::new(&args.db_path, MentionMatcher::new(args.patterns()))?;
        status["pending_mentions"] =
            serde_json::json!(store.unprocessed_mentions()?.len());
        if let Some(stats) = store.today_stats()? {
            status["today"] = serde_json::json!({
                "date": stats.date,
                "total_checks": stats.total_checks,
                "new_mentions": stats.new_mentions,
                "processed_mentions": stats.processed_mentions,
                "api_calls": stats.api_calls,
                "tokens_used": stats.tokens_used,
            });
        }
    }

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Copies the built-in prompt templates into `dir`, never overwriting an
/// existing file.
fn setup_templates(dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create template directory {}", dir.display()))?;
    for kind in [
        ItemKind::Issue,
        ItemKind::IssueComment,
        ItemKind::Pr,
        ItemKind::PrComment,
    ] {
        let path = dir.join(mention_runtime::prompts::template_file_name(kind));
        if path.exists() {
            println!("kept    {}", path.display());
            continue;
        }
        std::fs::write(&path, mention_runtime::prompts::default_template(kind))
            .with_context(|| format!("failed to write template {}", path.display()))?;
        println!("created {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::tempdir;

    #[test]
    fn unit_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn unit_mention_patterns_split_and_trim() {
        let cli = Cli::parse_from([
            "mention-bot",
            "--mention-patterns",
            " @claude , @claude-code ,,",
            "status",
        ]);
        assert_eq!(cli.config.patterns(), vec!["@claude", "@claude-code"]);
    }

    #[test]
    fn unit_bot_config_requires_token_and_repo() {
        let cli = Cli::parse_from(["mention-bot", "run-once"]);
        let mut args = cli.config;
        args.github_token = None;
        args.repo = None;
        assert!(args.bot_config().is_err());

        args.github_token = Some("ghp_test".to_string());
        assert!(args.bot_config().is_err());

        args.repo = Some("octo/widgets".to_string());
        let config = args.bot_config().expect("config");
        assert_eq!(config.repo.full_name(), "octo/widgets");
        assert_eq!(config.max_concurrent, 3);
    }

    #[test]
    fn functional_setup_writes_templates_without_clobbering() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("templates");
        setup_templates(&target).expect("setup");
        for name in ["issue.txt", "issue_comment.txt", "pr.txt", "pr_comment.txt"] {
            assert!(target.join(name).exists());
        }

        std::fs::write(target.join("pr.txt"), "customized").expect("customize");
        setup_templates(&target).expect("re-run setup");
        let kept = std::fs::read_to_string(target.join("pr.txt")).expect("read");
        assert_eq!(kept, "customized");
    }
}
