use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Owner/name pair identifying the repository under watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Parses `owner/name`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let mut parts = trimmed.splitn(2, '/');
        let owner = parts.next().unwrap_or_default().trim();
        let name = parts.next().unwrap_or_default().trim();
        if owner.is_empty() || name.is_empty() {
            bail!("repository must be 'owner/name', got '{raw}'");
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Runtime configuration for the mention bot.
///
/// Built by the CLI layer from flags and environment variables; every
/// consumer receives it already validated.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub github_token: String,
    pub repo: RepoRef,
    pub api_base: String,
    /// Case-insensitive substrings that count as a mention.
    pub mention_patterns: Vec<String>,
    /// Five-field cron expression for detection cycles, evaluated in UTC.
    pub detection_cron: String,
    /// Five-field cron expression for database backups, evaluated in UTC.
    pub backup_cron: String,
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_retention_days: u32,
    /// In-flight dispatch ceiling, clamped to 1..=10.
    pub max_concurrent: usize,
    /// Estimated-token spend allowed per UTC day.
    pub daily_token_limit: u64,
    pub assistant_executable: String,
    pub assistant_api_key: Option<String>,
    /// Working directory the assistant subprocess runs in.
    pub workspace_dir: PathBuf,
    /// Directory of prompt template overrides; built-ins apply when absent.
    pub template_dir: Option<PathBuf>,
    pub dispatch_delay_ms: u64,
    pub assistant_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub pid_file: PathBuf,
}

impl BotConfig {
    /// Validates field combinations and clamps the dispatch ceiling.
    pub fn normalized(mut self) -> Result<Self> {
        if self.github_token.trim().is_empty() {
            bail!("github token is required");
        }
        if self.assistant_executable.trim().is_empty() {
            bail!("assistant executable is required");
        }
        self.mention_patterns = self
            .mention_patterns
            .iter()
            .map(|pattern| pattern.trim().to_string())
            .filter(|pattern| !pattern.is_empty())
            .collect();
        if self.mention_patterns.is_empty() {
            bail!("at least one mention pattern is required");
        }

        if !self.workspace_dir.is_dir() {
            bail!(
                "workspace directory {} does not exist",
                self.workspace_dir.display()
            );
        }

        let clamped = self.max_concurrent.clamp(1, 10);
        if clamped != self.max_concurrent {
            tracing::warn!(
                requested = self.max_concurrent,
                effective = clamped,
                "dispatch ceiling out of range, clamped"
            );
            self.max_concurrent = clamped;
        }

        self.api_base = self.api_base.trim_end_matches('/').to_string();
        parse_cron_schedule(&self.detection_cron)
            .with_context(|| format!("invalid detection cron '{}'", self.detection_cron))?;
        parse_cron_schedule(&self.backup_cron)
            .with_context(|| format!("invalid backup cron '{}'", self.backup_cron))?;
        Ok(self)
    }

    /// Initial scan watermark when the store has no prior state.
    pub fn default_watermark() -> DateTime<Utc> {
        Utc::now() - ChronoDuration::hours(1)
    }
}

/// Parses a five-field cron expression, also accepting the six-field form
/// with a leading seconds column.
pub fn parse_cron_schedule(expression: &str) -> Result<cron::Schedule> {
    use std::str::FromStr;

    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();
    let with_seconds = if fields == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&with_seconds)
        .with_context(|| format!("failed to parse cron expression '{expression}'"))
}

/// Next occurrence of `schedule` strictly after `from`, in UTC.
pub fn next_cron_occurrence(
    schedule: &cron::Schedule,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.after(&from).next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BotConfig {
        BotConfig {
            github_token: "ghp_test".to_string(),
            repo: RepoRef::parse("octo/widgets").expect("repo"),
            api_base: "https://api.github.com/".to_string(),
            mention_patterns: vec!["@claude".to_string(), " @claude-code ".to_string()],
            detection_cron: "*/5 * * * *".to_string(),
            backup_cron: "0 2 * * *".to_string(),
            db_path: PathBuf::from("mention_tracker.db"),
            backup_dir: PathBuf::from("backups"),
            backup_retention_days: 7,
            max_concurrent: 3,
            daily_token_limit: 45_000,
            assistant_executable: "claude".to_string(),
            assistant_api_key: None,
            workspace_dir: PathBuf::from("."),
            template_dir: None,
            dispatch_delay_ms: 2_000,
            assistant_timeout_ms: 300_000,
            request_timeout_ms: 30_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            pid_file: PathBuf::from("mention-bot.pid"),
        }
    }

    #[test]
    fn unit_repo_ref_parses_owner_and_name() {
        let repo = RepoRef::parse(" octo/widgets ").expect("parse");
        assert_eq!(repo.owner, "octo");
        assert_eq!(repo.name, "widgets");
        assert_eq!(repo.full_name(), "octo/widgets");
        assert!(RepoRef::parse("no-slash").is_err());
        assert!(RepoRef::parse("/name").is_err());
    }

    #[test]
    fn unit_normalized_trims_patterns_and_api_base() {
        let config = test_config().normalized().expect("normalize");
        assert_eq!(config.mention_patterns, vec!["@claude", "@claude-code"]);
        assert_eq!(config.api_base, "https://api.github.com");
    }

    #[test]
    fn unit_normalized_clamps_dispatch_ceiling() {
        let mut config = test_config();
        config.max_concurrent = 0;
        assert_eq!(config.normalized().expect("normalize").max_concurrent, 1);

        let mut config = test_config();
        config.max_concurrent = 64;
        assert_eq!(config.normalized().expect("normalize").max_concurrent, 10);
    }

    #[test]
    fn unit_normalized_rejects_missing_token_and_patterns() {
        let mut config = test_config();
        config.github_token = "  ".to_string();
        assert!(config.normalized().is_err());

        let mut config = test_config();
        config.mention_patterns = vec!["  ".to_string()];
        assert!(config.normalized().is_err());
    }

    #[test]
    fn unit_normalized_rejects_missing_workspace_directory() {
        let mut config = test_config();
        config.workspace_dir = PathBuf::from("/definitely/not/a/real/dir");
        assert!(config.normalized().is_err());
    }

    #[test]
    fn unit_parse_cron_schedule_accepts_five_field_expressions() {
        let schedule = parse_cron_schedule("*/5 * * * *").expect("parse");
        let from = DateTime::parse_from_rfc3339("2024-06-01T10:02:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let next = next_cron_occurrence(&schedule, from).expect("next");
        assert_eq!(next.to_rfc3339(), "2024-06-01T10:05:00+00:00");
    }

    #[test]
    fn regression_parse_cron_schedule_rejects_garbage() {
        assert!(parse_cron_schedule("every five minutes").is_err());
        assert!(parse_cron_schedule("").is_err());
    }
}
