//! Detection cycle: poll the hosting api, filter through the mention
//! matcher and the dedup store, and emit one event per new mention.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use mention_store::{ItemKind, MentionMatcher, MentionRecord, SqliteMentionStore};

use crate::github::HostingApi;

/// One confirmed mention, carrying everything prompt rendering needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionEvent {
    /// History id assigned by the store.
    pub record_id: i64,
    pub kind: ItemKind,
    /// Issue/PR number for top-level items, comment id for comments.
    pub item_id: u64,
    /// Issue or pull request number the item belongs to.
    pub number: Option<u64>,
    pub title: Option<String>,
    pub author: String,
    pub content: String,
    pub html_url: String,
}

impl MentionEvent {
    /// Rehydrates an event from a persisted history row. Title and url are
    /// not stored, so backlog prompts render without them.
    pub fn from_record(record: &MentionRecord) -> Self {
        Self {
            record_id: record.id,
            kind: record.kind,
            item_id: record.item_id,
            number: if record.kind.is_comment() {
                record.parent_id
            } else {
                Some(record.item_id)
            },
            title: None,
            author: record.user_login.clone(),
            content: record.content.clone(),
            html_url: String::new(),
        }
    }
}

/// Outcome of one detection cycle.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub events: Vec<MentionEvent>,
    pub scanned_items: u64,
    pub api_calls: u64,
}

pub struct MentionScanner {
    api: Arc<dyn HostingApi>,
    store: Arc<SqliteMentionStore>,
    matcher: MentionMatcher,
}

impl MentionScanner {
    pub fn new(
        api: Arc<dyn HostingApi>,
        store: Arc<SqliteMentionStore>,
        matcher: MentionMatcher,
    ) -> Self {
        Self {
            api,
            store,
            matcher,
        }
    }

    /// Polls all four item streams updated since the watermark and records
    /// every mention whose content changed since its last observation.
    ///
    /// A mention in unchanged content is dropped here, which is what makes
    /// restarts and overlapping polls redelivery-safe.
    pub async fn scan_since(&self, since: DateTime<Utc>) -> Result<ScanReport> {
        let watermark = since.to_rfc3339();
        let mut report = ScanReport::default();

        let issues = self.api.list_updated_issues(&watermark).await?;
        report.api_calls += 1;
        for issue in issues {
            report.scanned_items += 1;
            let content = issue.body.clone().unwrap_or_default();
            self.consider(
                &mut report,
                ItemKind::Issue,
                issue.number,
                None,
                Some(issue.number),
                Some(issue.title),
                &issue.user.login,
                &content,
                &issue.html_url,
            )?;
        }

        let pulls = self.api.list_updated_pull_requests(&watermark).await?;
        report.api_calls += 1;
        for pull in pulls {
            report.scanned_items += 1;
            let content = pull.body.clone().unwrap_or_default();
            self.consider(
                &mut report,
                ItemKind::Pr,
                pull.number,
                None,
                Some(pull.number),
                Some(pull.title),
                &pull.user.login,
                &content,
                &pull.html_url,
            )?;
        }

        let comments = self.api.list_issue_comments(&watermark).await?;
        report.api_calls += 1;
        for comment in comments {
            report.scanned_items += 1;
            let parent = comment.parent_number();
            let content = comment.body.clone().unwrap_or_default();
            self.consider(
                &mut report,
                ItemKind::IssueComment,
                comment.id,
                parent,
                parent,
                None,
                &comment.user.login,
                &content,
                &comment.html_url,
            )?;
        }

        let review_comments = self.api.list_review_comments(&watermark).await?;
        report.api_calls += 1;
        for comment in review_comments {
            report.scanned_items += 1;
            let parent = comment.parent_number();
            let content = comment.body.clone().unwrap_or_default();
            self.consider(
                &mut report,
                ItemKind::PrComment,
                comment.id,
                parent,
                parent,
                None,
                &comment.user.login,
                &content,
                &comment.html_url,
            )?;
        }

        // One scan counts as one api-call unit, however many sub-fetches
        // it took.
        self.store
            .update_daily_stats(report.events.len() as u64, 1, 0)?;
        tracing::info!(
            scanned = report.scanned_items,
            new_mentions = report.events.len(),
            "detection cycle complete"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn consider(
        &self,
        report: &mut ScanReport,
        kind: ItemKind,
        item_id: u64,
        parent_id: Option<u64>,
        number: Option<u64>,
        title: Option<String>,
        author: &str,
        content: &str,
        html_url: &str,
    ) -> Result<()> {
        // Every observed item goes through the dedup ledger, mention or
        // not, so an edit away from a mention updates the tracked hash and
        // a later restore is seen as a change again.
        if !self
            .store
            .is_content_changed(kind, item_id, content, parent_id)?
        {
            return Ok(());
        }
        if !self.matcher.matches(content) {
            return Ok(());
        }
        let record_id = self
            .store
            .record_mention(kind, item_id, author, content, parent_id)?;
        report.events.push(MentionEvent {
            record_id,
            kind,
            item_id,
            number,
            title,
            author: author.to_string(),
            content: content.to_string(),
            html_url: html_url.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{
        GithubComment, GithubIssue, GithubPullRequest, GithubRepository, GithubUser,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeApi {
        issues: Mutex<Vec<GithubIssue>>,
        pulls: Mutex<Vec<GithubPullRequest>>,
        issue_comments: Mutex<Vec<GithubComment>>,
        review_comments: Mutex<Vec<GithubComment>>,
    }

    #[async_trait]
    impl HostingApi for FakeApi {
        async fn list_updated_issues(&self, _since: &str) -> Result<Vec<GithubIssue>> {
            Ok(self.issues.lock().expect("lock").clone())
        }

        async fn list_updated_pull_requests(&self, _since: &str) -> Result<Vec<GithubPullRequest>> {
            Ok(self.pulls.lock().expect("lock").clone())
        }

        async fn list_issue_comments(&self, _since: &str) -> Result<Vec<GithubComment>> {
            Ok(self.issue_comments.lock().expect("lock").clone())
        }

        async fn list_review_comments(&self, _since: &str) -> Result<Vec<GithubComment>> {
            Ok(self.review_comments.lock().expect("lock").clone())
        }

        async fn get_issue(&self, number: u64) -> Result<GithubIssue> {
            anyhow::bail!("issue {number} not found")
        }

        async fn get_pull_request(&self, number: u64) -> Result<GithubPullRequest> {
            anyhow::bail!("pull request {number} not found")
        }

        async fn get_repository(&self) -> Result<GithubRepository> {
            Ok(GithubRepository {
                full_name: "o/r".to_string(),
                default_branch: Some("main".to_string()),
                private: false,
            })
        }

        async fn create_comment(&self, _issue_number: u64, _body: &str) -> Result<()> {
            Ok(())
        }
    }

    fn user(login: &str) -> GithubUser {
        GithubUser {
            login: login.to_string(),
        }
    }

    fn issue(number: u64, title: &str, body: &str) -> GithubIssue {
        GithubIssue {
            id: number * 1000,
            number,
            title: title.to_string(),
            body: Some(body.to_string()),
            user: user("alice"),
            state: "open".to_string(),
            labels: Vec::new(),
            updated_at: "2024-06-01T10:00:00Z".to_string(),
            html_url: format!("https://github.com/o/r/issues/{number}"),
            pull_request: None,
        }
    }

    fn issue_comment(id: u64, parent: u64, body: &str) -> GithubComment {
        GithubComment {
            id,
            body: Some(body.to_string()),
            user: user("bob"),
            updated_at: "2024-06-01T10:00:00Z".to_string(),
            html_url: format!("https://github.com/o/r/issues/{parent}#issuecomment-{id}"),
            issue_url: Some(format!("https://api.github.com/repos/o/r/issues/{parent}")),
            pull_request_url: None,
        }
    }

    fn scanner_with(api: Arc<FakeApi>, dir: &std::path::Path) -> MentionScanner {
        let matcher = MentionMatcher::new(["@claude"]);
        let store = Arc::new(
            SqliteMentionStore::new(dir.join("scan.db"), matcher.clone()).expect("store"),
        );
        MentionScanner::new(api, store, matcher)
    }

    #[tokio::test]
    async fn functional_scan_records_mentions_from_all_streams() {
        let api = Arc::new(FakeApi::default());
        *api.issues.lock().expect("lock") = vec![
            issue(1, "Fix crash", "@claude implement a fix"),
            issue(2, "No mention here", "plain issue"),
        ];
        *api.issue_comments.lock().expect("lock") =
            vec![issue_comment(500, 1, "@claude review this")];

        let dir = tempdir().expect("tempdir");
        let scanner = scanner_with(Arc::clone(&api), dir.path());

        let report = scanner.scan_since(Utc::now()).await.expect("scan");
        assert_eq!(report.api_calls, 4);
        assert_eq!(report.scanned_items, 3);
        assert_eq!(report.events.len(), 2);

        let kinds: Vec<_> = report.events.iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![ItemKind::Issue, ItemKind::IssueComment]);
        assert_eq!(report.events[1].number, Some(1));
        assert_eq!(report.events[1].item_id, 500);
    }

    #[tokio::test]
    async fn functional_rescan_of_unchanged_content_emits_nothing() {
        let api = Arc::new(FakeApi::default());
        *api.issues.lock().expect("lock") = vec![issue(1, "Fix crash", "@claude please")];

        let dir = tempdir().expect("tempdir");
        let scanner = scanner_with(Arc::clone(&api), dir.path());

        let first = scanner.scan_since(Utc::now()).await.expect("first scan");
        assert_eq!(first.events.len(), 1);

        let second = scanner.scan_since(Utc::now()).await.expect("second scan");
        assert!(second.events.is_empty());

        // An edit to the mentioned content is a fresh mention.
        *api.issues.lock().expect("lock") = vec![issue(1, "Fix crash", "@claude please, again")];
        let third = scanner.scan_since(Utc::now()).await.expect("third scan");
        assert_eq!(third.events.len(), 1);
    }

    #[tokio::test]
    async fn functional_scan_updates_daily_stats() {
        let api = Arc::new(FakeApi::default());
        *api.issues.lock().expect("lock") = vec![issue(1, "Task", "@claude help")];

        let dir = tempdir().expect("tempdir");
        let matcher = MentionMatcher::new(["@claude"]);
        let store = Arc::new(
            SqliteMentionStore::new(dir.path().join("scan.db"), matcher.clone()).expect("store"),
        );
        let scanner = MentionScanner::new(api, Arc::clone(&store), matcher);

        scanner.scan_since(Utc::now()).await.expect("scan");
        let stats = store.today_stats().expect("stats").expect("row");
        assert_eq!(stats.total_checks, 1);
        assert_eq!(stats.new_mentions, 1);
        // A whole scan is one api-call unit, not four.
        assert_eq!(stats.api_calls, 1);
    }

    #[tokio::test]
    async fn regression_mention_restored_after_edit_away_is_redetected() {
        let api = Arc::new(FakeApi::default());
        *api.issues.lock().expect("lock") = vec![issue(1, "Fix crash", "@claude please fix")];

        let dir = tempdir().expect("tempdir");
        let scanner = scanner_with(Arc::clone(&api), dir.path());
        assert_eq!(scanner.scan_since(Utc::now()).await.expect("scan").events.len(), 1);

        // The author edits the mention out, then restores the exact text.
        *api.issues.lock().expect("lock") = vec![issue(1, "Fix crash", "working on it myself")];
        assert!(scanner.scan_since(Utc::now()).await.expect("scan").events.is_empty());

        *api.issues.lock().expect("lock") = vec![issue(1, "Fix crash", "@claude please fix")];
        let restored = scanner.scan_since(Utc::now()).await.expect("scan");
        assert_eq!(restored.events.len(), 1);
    }

    #[tokio::test]
    async fn regression_titles_are_not_mention_content() {
        let api = Arc::new(FakeApi::default());
        // A mention in the title alone is not a mention.
        *api.issues.lock().expect("lock") = vec![issue(1, "@claude in the title", "plain body")];

        let dir = tempdir().expect("tempdir");
        let scanner = scanner_with(Arc::clone(&api), dir.path());
        assert!(scanner.scan_since(Utc::now()).await.expect("scan").events.is_empty());

        // A title edit on a mention-bearing issue does not retrigger it.
        *api.issues.lock().expect("lock") = vec![issue(2, "Old title", "@claude review")];
        assert_eq!(scanner.scan_since(Utc::now()).await.expect("scan").events.len(), 1);
        *api.issues.lock().expect("lock") = vec![issue(2, "New title", "@claude review")];
        assert!(scanner.scan_since(Utc::now()).await.expect("scan").events.is_empty());
    }

    #[test]
    fn unit_event_rehydrates_from_history_record() {
        let record = MentionRecord {
            id: 12,
            kind: ItemKind::PrComment,
            item_id: 700,
            parent_id: Some(9),
            user_login: "carol".to_string(),
            content: "@claude test this".to_string(),
            detected_at: Utc::now(),
            processed: false,
            processed_at: None,
        };
        let event = MentionEvent::from_record(&record);
        assert_eq!(event.record_id, 12);
        assert_eq!(event.number, Some(9));
        assert_eq!(event.item_id, 700);
        assert!(event.title.is_none());
    }
}
