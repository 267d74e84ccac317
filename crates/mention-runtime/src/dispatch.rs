//! Sequential dispatch of detected mentions to the assistant CLI.
//!
//! Failures are isolated per mention: every attempted mention is marked
//! processed whether the assistant succeeded or not, so a poison mention is
//! redelivered at most once across restarts. Mentions skipped before an
//! attempt (ceiling or token budget) stay unprocessed and retry next cycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mention_store::{ItemKind, SqliteMentionStore};

use crate::assistant::{AssistantInvoker, AssistantOutcome};
use crate::config::RepoRef;
use crate::github::HostingApi;
use crate::prompts::{ItemDetail, PromptLibrary};
use crate::scanner::MentionEvent;

/// Per-action token cost estimates used against the daily budget.
pub fn estimate_tokens(action: &str) -> u64 {
    match action {
        "implement" => 5_000,
        "review" => 3_000,
        "improve" => 2_500,
        "analyze" => 2_000,
        "test" => 2_000,
        "help" => 0,
        _ => 1_000,
    }
}

/// First word following the first mention pattern, lowercased with trailing
/// punctuation stripped. Defaults to `help` when the mention stands alone.
pub fn extract_action(content: &str, patterns: &[String]) -> String {
    let lowered = content.to_lowercase();
    let mut earliest: Option<usize> = None;
    for pattern in patterns {
        let pattern = pattern.to_lowercase();
        if let Some(position) = lowered.find(&pattern) {
            let end = position + pattern.len();
            earliest = Some(earliest.map_or(end, |current| current.min(end)));
        }
    }
    let Some(after) = earliest else {
        return "help".to_string();
    };
    lowered[after..]
        .split_whitespace()
        .next()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|word| !word.is_empty())
        .unwrap_or_else(|| "help".to_string())
}

/// Counters for one dispatch batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_over_budget: usize,
    pub skipped_at_ceiling: usize,
}

pub struct MentionDispatcher {
    store: Arc<SqliteMentionStore>,
    api: Arc<dyn HostingApi>,
    invoker: Arc<dyn AssistantInvoker>,
    prompts: PromptLibrary,
    repo: RepoRef,
    mention_patterns: Vec<String>,
    max_concurrent: usize,
    daily_token_limit: u64,
    delay: Duration,
    /// Debug context echoed in result comments.
    workspace_dir: String,
    assistant_executable: String,
    running: Arc<AtomicUsize>,
}

struct RunningGuard {
    running: Arc<AtomicUsize>,
}

impl RunningGuard {
    fn acquire(running: &Arc<AtomicUsize>) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        Self {
            running: Arc::clone(running),
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MentionDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SqliteMentionStore>,
        api: Arc<dyn HostingApi>,
        invoker: Arc<dyn AssistantInvoker>,
        prompts: PromptLibrary,
        repo: RepoRef,
        mention_patterns: Vec<String>,
        max_concurrent: usize,
        daily_token_limit: u64,
        delay: Duration,
        workspace_dir: String,
        assistant_executable: String,
    ) -> Self {
        Self {
            store,
            api,
            invoker,
            prompts,
            repo,
            mention_patterns,
            max_concurrent: max_concurrent.clamp(1, 10),
            daily_token_limit,
            delay,
            workspace_dir,
            assistant_executable,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Mentions currently being dispatched. Nonzero only while another
    /// dispatch loop overlaps this one.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Dispatches `events` in order, one assistant run at a time, with the
    /// configured pause between mentions.
    pub async fn dispatch(&self, events: &[MentionEvent]) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        for (index, event) in events.iter().enumerate() {
            if self.running.load(Ordering::SeqCst) >= self.max_concurrent {
                tracing::warn!(
                    record_id = event.record_id,
                    ceiling = self.max_concurrent,
                    "dispatch ceiling reached, mention deferred to next cycle"
                );
                report.skipped_at_ceiling += 1;
                continue;
            }

            let action = extract_action(&event.content, &self.mention_patterns);
            let estimate = estimate_tokens(&action);
            let spent = self
                .store
                .today_stats()?
                .map(|stats| stats.tokens_used)
                .unwrap_or(0);
            if spent.saturating_add(estimate) > self.daily_token_limit {
                tracing::warn!(
                    record_id = event.record_id,
                    action,
                    estimate,
                    spent,
                    limit = self.daily_token_limit,
                    "daily token budget exhausted, mention deferred"
                );
                report.skipped_over_budget += 1;
                self.post_comment(
                    event,
                    "The daily token budget for mention processing is exhausted. \
                     This request stays queued and will be retried when the budget resets.",
                )
                .await;
                continue;
            }

            let guard = RunningGuard::acquire(&self.running);
            report.attempted += 1;

            // The workspace can disappear while the daemon runs; treat it
            // like any other classified failure for this mention.
            if !std::path::Path::new(&self.workspace_dir).is_dir() {
                report.failed += 1;
                tracing::error!(
                    record_id = event.record_id,
                    workspace = self.workspace_dir,
                    "target workspace directory does not exist"
                );
                self.post_comment(
                    event,
                    &self.failure_comment(
                        event,
                        &format!(
                            "the configured workspace directory `{}` does not exist",
                            self.workspace_dir
                        ),
                    ),
                )
                .await;
                drop(guard);
                self.store.mark_mention_processed(event.record_id)?;
                continue;
            }

            let detail = self.fetch_detail(event).await;
            let prompt = self
                .prompts
                .render_with_detail(event, &self.repo, detail.as_ref());
            match self.invoker.run_prompt(&prompt).await {
                Ok(run) if run.outcome.is_success() => {
                    report.succeeded += 1;
                    tracing::info!(
                        record_id = event.record_id,
                        kind = event.kind.as_str(),
                        action,
                        duration_ms = run.duration.as_millis() as u64,
                        "mention dispatched"
                    );
                    self.store.update_daily_stats(0, 0, estimate)?;
                    self.post_comment(event, &self.result_comment(event, &run.outcome))
                        .await;
                }
                Ok(run) => {
                    report.failed += 1;
                    tracing::warn!(
                        record_id = event.record_id,
                        kind = event.kind.as_str(),
                        outcome = run.outcome.describe(),
                        "assistant run did not complete"
                    );
                    self.post_comment(event, &self.result_comment(event, &run.outcome))
                        .await;
                }
                Err(error) => {
                    report.failed += 1;
                    tracing::error!(
                        record_id = event.record_id,
                        kind = event.kind.as_str(),
                        error = format!("{error:#}"),
                        "assistant invocation failed"
                    );
                    self.post_comment(
                        event,
                        &self.failure_comment(event, "the assistant process could not be run"),
                    )
                    .await;
                }
            }
            drop(guard);

            // Attempted means consumed, success or not.
            self.store.mark_mention_processed(event.record_id)?;

            if index + 1 < events.len() && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        Ok(report)
    }

    /// Best-effort fetch of the parent item, for richer prompt variables.
    /// A fetch failure degrades the prompt, never the dispatch.
    async fn fetch_detail(&self, event: &MentionEvent) -> Option<ItemDetail> {
        let number = event.number?;
        let fetched = match event.kind {
            ItemKind::Issue | ItemKind::IssueComment => {
                self.api.get_issue(number).await.map(|issue| ItemDetail {
                    title: Some(issue.title),
                    state: some_nonempty(issue.state),
                    labels: issue.labels.into_iter().map(|label| label.name).collect(),
                    base_branch: None,
                    head_branch: None,
                })
            }
            ItemKind::Pr | ItemKind::PrComment => {
                self.api.get_pull_request(number).await.map(|pull| ItemDetail {
                    title: Some(pull.title),
                    state: some_nonempty(pull.state),
                    labels: Vec::new(),
                    base_branch: pull.base.map(|base| base.branch),
                    head_branch: pull.head.map(|head| head.branch),
                })
            }
        };
        match fetched {
            Ok(detail) => Some(detail),
            Err(error) => {
                tracing::warn!(
                    record_id = event.record_id,
                    number,
                    error = format!("{error:#}"),
                    "failed to fetch item detail, rendering prompt without it"
                );
                None
            }
        }
    }

    /// Posts a result comment on the parent issue or pull request, falling
    /// back to the item's own id when no parent number is known. Comment
    /// failures are warnings; the dispatch outcome is already recorded.
    async fn post_comment(&self, event: &MentionEvent, body: &str) {
        let number = event.number.unwrap_or(event.item_id);
        if let Err(error) = self.api.create_comment(number, body).await {
            tracing::warn!(
                record_id = event.record_id,
                number,
                error = format!("{error:#}"),
                "failed to post result comment"
            );
        }
    }

    fn result_comment(&self, event: &MentionEvent, outcome: &AssistantOutcome) -> String {
        match outcome {
            AssistantOutcome::Completed { .. } => format!(
                "@{} the assistant has finished processing this mention.\n\n\
                 ---\nworkspace: `{}`\nassistant: `{}`",
                event.author, self.workspace_dir, self.assistant_executable
            ),
            other => self.failure_comment(event, &other.describe()),
        }
    }

    fn failure_comment(&self, event: &MentionEvent, reason: &str) -> String {
        format!(
            "@{} the assistant could not process this mention: {}.\n\n\
             ---\nworkspace: `{}`\nassistant: `{}`",
            event.author, reason, self.workspace_dir, self.assistant_executable
        )
    }
}

fn some_nonempty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::AssistantRun;
    use crate::github::{
        GithubComment, GithubIssue, GithubLabel, GithubPullRequest, GithubRepository, GithubUser,
    };
    use async_trait::async_trait;
    use mention_store::MentionMatcher;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeApi {
        comments: Mutex<Vec<(u64, String)>>,
    }

    #[async_trait]
    impl HostingApi for FakeApi {
        async fn list_updated_issues(&self, _since: &str) -> Result<Vec<GithubIssue>> {
            Ok(Vec::new())
        }

        async fn list_updated_pull_requests(
            &self,
            _since: &str,
        ) -> Result<Vec<GithubPullRequest>> {
            Ok(Vec::new())
        }

        async fn list_issue_comments(&self, _since: &str) -> Result<Vec<GithubComment>> {
            Ok(Vec::new())
        }

        async fn list_review_comments(&self, _since: &str) -> Result<Vec<GithubComment>> {
            Ok(Vec::new())
        }

        async fn get_issue(&self, number: u64) -> Result<GithubIssue> {
            Ok(GithubIssue {
                id: number,
                number,
                title: "Fetched title".to_string(),
                body: None,
                user: GithubUser {
                    login: "alice".to_string(),
                },
                state: "open".to_string(),
                labels: vec![GithubLabel {
                    name: "bug".to_string(),
                }],
                updated_at: "2024-06-01T10:00:00Z".to_string(),
                html_url: format!("https://github.com/o/r/issues/{number}"),
                pull_request: None,
            })
        }

        async fn get_pull_request(&self, _number: u64) -> Result<GithubPullRequest> {
            anyhow::bail!("not a pull request")
        }

        async fn get_repository(&self) -> Result<GithubRepository> {
            Ok(GithubRepository {
                full_name: "o/r".to_string(),
                default_branch: Some("main".to_string()),
                private: false,
            })
        }

        async fn create_comment(&self, issue_number: u64, body: &str) -> Result<()> {
            self.comments
                .lock()
                .expect("lock")
                .push((issue_number, body.to_string()));
            Ok(())
        }
    }

    struct FakeInvoker {
        prompts: Mutex<Vec<String>>,
        outcomes: Mutex<Vec<AssistantOutcome>>,
    }

    impl FakeInvoker {
        fn new(outcomes: Vec<AssistantOutcome>) -> Self {
            Self {
                prompts: Mutex::new(Vec::new()),
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl AssistantInvoker for FakeInvoker {
        async fn run_prompt(&self, prompt: &str) -> Result<AssistantRun> {
            self.prompts.lock().expect("lock").push(prompt.to_string());
            let mut outcomes = self.outcomes.lock().expect("lock");
            let outcome = if outcomes.is_empty() {
                AssistantOutcome::Completed {
                    stdout_summary: "ok".to_string(),
                }
            } else {
                outcomes.remove(0)
            };
            Ok(AssistantRun {
                outcome,
                duration: Duration::from_millis(5),
            })
        }
    }

    struct SlowInvoker;

    #[async_trait]
    impl AssistantInvoker for SlowInvoker {
        async fn run_prompt(&self, _prompt: &str) -> Result<AssistantRun> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(AssistantRun {
                outcome: AssistantOutcome::Completed {
                    stdout_summary: "ok".to_string(),
                },
                duration: Duration::from_millis(200),
            })
        }
    }

    fn store_in(dir: &std::path::Path) -> Arc<SqliteMentionStore> {
        Arc::new(
            SqliteMentionStore::new(dir.join("dispatch.db"), MentionMatcher::new(["@claude"]))
                .expect("store"),
        )
    }

    fn recorded_event(store: &SqliteMentionStore, number: u64, content: &str) -> MentionEvent {
        let record_id = store
            .record_mention(ItemKind::Issue, number, "alice", content, None)
            .expect("record");
        MentionEvent {
            record_id,
            kind: ItemKind::Issue,
            item_id: number,
            number: Some(number),
            title: Some("A task".to_string()),
            author: "alice".to_string(),
            content: content.to_string(),
            html_url: format!("https://github.com/o/r/issues/{number}"),
        }
    }

    fn dispatcher_with(
        store: Arc<SqliteMentionStore>,
        api: Arc<FakeApi>,
        invoker: Arc<FakeInvoker>,
        daily_token_limit: u64,
    ) -> MentionDispatcher {
        MentionDispatcher::new(
            store,
            api,
            invoker,
            PromptLibrary::builtin(),
            RepoRef::parse("o/r").expect("repo"),
            vec!["@claude".to_string()],
            3,
            daily_token_limit,
            Duration::ZERO,
            std::env::temp_dir().display().to_string(),
            "claude".to_string(),
        )
    }

    #[test]
    fn unit_extract_action_reads_word_after_mention() {
        let patterns = vec!["@claude".to_string()];
        assert_eq!(extract_action("@claude implement the parser", &patterns), "implement");
        assert_eq!(extract_action("hey @CLAUDE Review this!", &patterns), "review");
        assert_eq!(extract_action("@claude", &patterns), "help");
        assert_eq!(extract_action("no mention at all", &patterns), "help");
    }

    #[test]
    fn unit_estimate_tokens_covers_known_actions() {
        assert_eq!(estimate_tokens("implement"), 5_000);
        assert_eq!(estimate_tokens("review"), 3_000);
        assert_eq!(estimate_tokens("help"), 0);
        assert_eq!(estimate_tokens("frobnicate"), 1_000);
    }

    #[tokio::test]
    async fn functional_dispatch_marks_every_attempt_processed() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let events = vec![
            recorded_event(&store, 1, "@claude review the diff"),
            recorded_event(&store, 2, "@claude analyze the crash"),
        ];
        let invoker = Arc::new(FakeInvoker::new(vec![
            AssistantOutcome::Completed {
                stdout_summary: "ok".to_string(),
            },
            AssistantOutcome::Failed {
                summary: "boom".to_string(),
            },
        ]));
        let api = Arc::new(FakeApi::default());
        let dispatcher = dispatcher_with(Arc::clone(&store), Arc::clone(&api), invoker, 45_000);

        let report = dispatcher.dispatch(&events).await.expect("dispatch");
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        // Both attempts are consumed, including the failed one.
        assert!(store.unprocessed_mentions().expect("pending").is_empty());

        // One result comment per attempt, with the debug context footer.
        let comments = api.comments.lock().expect("lock");
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].0, 1);
        assert!(comments[0].1.starts_with("@alice"));
        assert!(comments[0].1.contains("finished processing"));
        assert!(comments[0].1.contains("workspace:"));
        assert!(comments[1].1.contains("could not process"));
        assert!(comments[1].1.contains("boom"));
    }

    #[tokio::test]
    async fn regression_missing_workspace_fails_mention_with_comment() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let events = vec![recorded_event(&store, 4, "@claude review")];
        let invoker = Arc::new(FakeInvoker::new(Vec::new()));
        let api = Arc::new(FakeApi::default());
        let dispatcher = MentionDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&api) as Arc<dyn HostingApi>,
            Arc::clone(&invoker) as Arc<dyn AssistantInvoker>,
            PromptLibrary::builtin(),
            RepoRef::parse("o/r").expect("repo"),
            vec!["@claude".to_string()],
            3,
            45_000,
            Duration::ZERO,
            dir.path().join("gone").display().to_string(),
            "claude".to_string(),
        );

        let report = dispatcher.dispatch(&events).await.expect("dispatch");
        assert_eq!(report.failed, 1);
        // The assistant is never launched and the mention is consumed.
        assert!(invoker.prompts.lock().expect("lock").is_empty());
        assert!(store.unprocessed_mentions().expect("pending").is_empty());
        let comments = api.comments.lock().expect("lock");
        assert!(comments[0].1.contains("does not exist"));
    }

    #[tokio::test]
    async fn functional_overlapping_batches_hit_dispatch_ceiling() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let batch_a = vec![recorded_event(&store, 1, "@claude review the diff")];
        let batch_b = vec![recorded_event(&store, 2, "@claude review the docs")];
        let dispatcher = MentionDispatcher::new(
            Arc::clone(&store),
            Arc::new(FakeApi::default()) as Arc<dyn HostingApi>,
            Arc::new(SlowInvoker) as Arc<dyn AssistantInvoker>,
            PromptLibrary::builtin(),
            RepoRef::parse("o/r").expect("repo"),
            vec!["@claude".to_string()],
            1,
            45_000,
            Duration::ZERO,
            std::env::temp_dir().display().to_string(),
            "claude".to_string(),
        );

        let (first, second) = tokio::join!(dispatcher.dispatch(&batch_a), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            dispatcher.dispatch(&batch_b).await
        });
        let first = first.expect("first batch");
        let second = second.expect("second batch");
        assert_eq!(first.succeeded, 1);
        assert_eq!(second.attempted, 0);
        assert_eq!(second.skipped_at_ceiling, 1);

        // The deferred mention stays queued for the next cycle.
        let pending = store.unprocessed_mentions().expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].item_id, 2);
    }

    #[tokio::test]
    async fn regression_orphan_comment_result_targets_its_own_id() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        // A review comment whose parent number could not be parsed.
        let record_id = store
            .record_mention(ItemKind::PrComment, 321, "alice", "@claude review", None)
            .expect("record");
        let event = MentionEvent {
            record_id,
            kind: ItemKind::PrComment,
            item_id: 321,
            number: None,
            title: None,
            author: "alice".to_string(),
            content: "@claude review".to_string(),
            html_url: String::new(),
        };
        let invoker = Arc::new(FakeInvoker::new(Vec::new()));
        let api = Arc::new(FakeApi::default());
        let dispatcher = dispatcher_with(Arc::clone(&store), Arc::clone(&api), invoker, 45_000);

        dispatcher.dispatch(&[event]).await.expect("dispatch");
        let comments = api.comments.lock().expect("lock");
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].0, 321);
    }

    #[tokio::test]
    async fn functional_dispatch_charges_tokens_only_for_successes() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let events = vec![
            recorded_event(&store, 1, "@claude implement feature"),
            recorded_event(&store, 2, "@claude implement another"),
        ];
        let invoker = Arc::new(FakeInvoker::new(vec![
            AssistantOutcome::Completed {
                stdout_summary: "ok".to_string(),
            },
            AssistantOutcome::TimedOut,
        ]));
        let api = Arc::new(FakeApi::default());
        let dispatcher = dispatcher_with(Arc::clone(&store), api, invoker, 45_000);

        dispatcher.dispatch(&events).await.expect("dispatch");
        let stats = store.today_stats().expect("stats").expect("row");
        assert_eq!(stats.tokens_used, 5_000);
    }

    #[tokio::test]
    async fn functional_over_budget_mentions_are_deferred_unmarked() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let events = vec![recorded_event(&store, 1, "@claude implement feature")];
        let invoker = Arc::new(FakeInvoker::new(Vec::new()));
        let api = Arc::new(FakeApi::default());
        // Limit below the 5000-token implement estimate.
        let dispatcher =
            dispatcher_with(Arc::clone(&store), Arc::clone(&api), Arc::clone(&invoker), 100);

        let report = dispatcher.dispatch(&events).await.expect("dispatch");
        assert_eq!(report.attempted, 0);
        assert_eq!(report.skipped_over_budget, 1);
        assert!(invoker.prompts.lock().expect("lock").is_empty());

        // Deferred mentions stay in the backlog for the next cycle and the
        // requester is told why.
        assert_eq!(store.unprocessed_mentions().expect("pending").len(), 1);
        let comments = api.comments.lock().expect("lock");
        assert_eq!(comments.len(), 1);
        assert!(comments[0].1.contains("token budget"));
    }

    #[tokio::test]
    async fn functional_rendered_prompt_reaches_the_invoker() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let events = vec![recorded_event(&store, 42, "@claude review carefully")];
        let invoker = Arc::new(FakeInvoker::new(Vec::new()));
        let dispatcher = dispatcher_with(store, Arc::new(FakeApi::default()), Arc::clone(&invoker), 45_000);

        dispatcher.dispatch(&events).await.expect("dispatch");
        let prompts = invoker.prompts.lock().expect("lock");
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Issue #42"));
        assert!(prompts[0].contains("@claude review carefully"));
    }

    #[tokio::test]
    async fn functional_backlog_event_prompt_uses_fetched_title() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        // Rehydrated backlog events carry no title.
        let mut event = recorded_event(&store, 8, "@claude analyze this");
        event.title = None;
        let invoker = Arc::new(FakeInvoker::new(Vec::new()));
        let dispatcher = dispatcher_with(store, Arc::new(FakeApi::default()), Arc::clone(&invoker), 45_000);

        dispatcher.dispatch(&[event]).await.expect("dispatch");
        let prompts = invoker.prompts.lock().expect("lock");
        assert!(prompts[0].contains("Fetched title"));
    }
}
