//! Content-hash change tracking and mention history persistence.
//!
//! The store is the dedup ledger for the mention bot: one row per observed
//! issue/PR/comment keyed by content digest, an append-only history of
//! confirmed mentions, and a per-day stats rollup.

use chrono::{DateTime, Utc};
use thiserror::Error;

mod matcher;
mod sqlite;

pub use matcher::MentionMatcher;
pub use sqlite::SqliteMentionStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the mention store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid item kind '{0}'")]
    InvalidItemKind(String),
    #[error("mention history entry {0} not found")]
    MentionNotFound(i64),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The four item classes the scanner observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Issue,
    IssueComment,
    Pr,
    PrComment,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::IssueComment => "issue_comment",
            Self::Pr => "pr",
            Self::PrComment => "pr_comment",
        }
    }

    pub fn parse(raw: &str) -> StoreResult<Self> {
        match raw {
            "issue" => Ok(Self::Issue),
            "issue_comment" => Ok(Self::IssueComment),
            "pr" => Ok(Self::Pr),
            "pr_comment" => Ok(Self::PrComment),
            other => Err(StoreError::InvalidItemKind(other.to_string())),
        }
    }

    /// True for comment kinds, whose `parent_id` carries the issue/PR number.
    pub fn is_comment(self) -> bool {
        matches!(self, Self::IssueComment | Self::PrComment)
    }
}

/// Dedup ledger row, one per distinct `(kind, item_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedItem {
    pub kind: ItemKind,
    pub item_id: u64,
    pub parent_id: Option<u64>,
    pub content_hash: String,
    pub has_mention: bool,
    pub last_checked: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of one confirmed mention occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionRecord {
    pub id: i64,
    pub kind: ItemKind,
    pub item_id: u64,
    pub parent_id: Option<u64>,
    pub user_login: String,
    pub content: String,
    pub detected_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Per-UTC-day processing counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyStats {
    pub date: String,
    pub total_checks: u64,
    pub new_mentions: u64,
    pub processed_mentions: u64,
    pub api_calls: u64,
    pub tokens_used: u64,
}
