//! GitHub REST client for the mention poll.
//!
//! Lists recently updated issues, pull requests, and both comment streams
//! with pagination and retry against transient failures. The [`HostingApi`]
//! trait is the seam the scanner tests fake.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::RepoRef;

#[derive(Debug, Clone, Deserialize)]
pub struct GithubUser {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubLabel {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubBranchRef {
    #[serde(rename = "ref")]
    pub branch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubRepository {
    pub full_name: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubIssue {
    pub id: u64,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub user: GithubUser,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub labels: Vec<GithubLabel>,
    pub updated_at: String,
    pub html_url: String,
    /// Present when the "issue" is the issue-facet of a pull request.
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubPullRequest {
    pub id: u64,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub user: GithubUser,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub base: Option<GithubBranchRef>,
    #[serde(default)]
    pub head: Option<GithubBranchRef>,
    pub updated_at: String,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubComment {
    pub id: u64,
    pub body: Option<String>,
    pub user: GithubUser,
    pub updated_at: String,
    pub html_url: String,
    /// API url of the issue this comment belongs to, e.g.
    /// `https://api.github.com/repos/o/r/issues/42`.
    #[serde(default)]
    pub issue_url: Option<String>,
    /// API url of the pull request, set on review comments.
    #[serde(default)]
    pub pull_request_url: Option<String>,
}

impl GithubComment {
    /// Issue or pull request number this comment hangs off, parsed from the
    /// trailing path segment of the api url.
    pub fn parent_number(&self) -> Option<u64> {
        let url = self
            .issue_url
            .as_deref()
            .or(self.pull_request_url.as_deref())?;
        url.trim_end_matches('/')
            .rsplit('/')
            .next()?
            .parse::<u64>()
            .ok()
    }
}

/// Read surface of the hosting provider the scanner polls.
#[async_trait]
pub trait HostingApi: Send + Sync {
    /// Open issues updated since the watermark, pull-request facets excluded.
    async fn list_updated_issues(&self, since: &str) -> Result<Vec<GithubIssue>>;
    /// Open pull requests updated since the watermark.
    async fn list_updated_pull_requests(&self, since: &str) -> Result<Vec<GithubPullRequest>>;
    /// Repository-wide issue comments updated since the watermark.
    async fn list_issue_comments(&self, since: &str) -> Result<Vec<GithubComment>>;
    /// Repository-wide pull request review comments updated since the watermark.
    async fn list_review_comments(&self, since: &str) -> Result<Vec<GithubComment>>;
    /// Full detail of one issue.
    async fn get_issue(&self, number: u64) -> Result<GithubIssue>;
    /// Full detail of one pull request.
    async fn get_pull_request(&self, number: u64) -> Result<GithubPullRequest>;
    /// Repository metadata, also serving as a connectivity check.
    async fn get_repository(&self) -> Result<GithubRepository>;
    /// Posts a comment on an issue or pull request.
    async fn create_comment(&self, issue_number: u64, body: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct GithubApiClient {
    http: reqwest::Client,
    api_base: String,
    repo: RepoRef,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl GithubApiClient {
    pub fn new(
        api_base: String,
        token: String,
        repo: RepoRef,
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("mention-bot"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            reqwest::header::HeaderValue::from_static("2022-11-28"),
        );
        let auth_header = format!("Bearer {}", token.trim());
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth_header)
                .context("invalid github authorization header")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create github api client")?;
        Ok(Self {
            http: client,
            api_base: api_base.trim_end_matches('/').to_string(),
            repo,
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
        })
    }

    async fn request_json<T, F>(&self, operation: &str, mut request_builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = request_builder().send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed = response
                            .json::<T>()
                            .await
                            .with_context(|| format!("failed to decode github {operation}"))?;
                        return Ok(parsed);
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts
                        && is_retryable_github_status(status.as_u16())
                    {
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    bail!(
                        "github api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("github api {operation} request failed"));
                }
            }
        }
    }

    async fn paginated<T, F>(&self, operation: &str, request_builder: F) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(u32) -> reqwest::RequestBuilder,
    {
        let mut page = 1_u32;
        let mut rows = Vec::new();
        loop {
            let chunk: Vec<T> = self.request_json(operation, || request_builder(page)).await?;
            let chunk_len = chunk.len();
            rows.extend(chunk);
            if chunk_len < 100 {
                break;
            }
            page = page.saturating_add(1);
        }
        Ok(rows)
    }
}

#[async_trait]
impl HostingApi for GithubApiClient {
    async fn list_updated_issues(&self, since: &str) -> Result<Vec<GithubIssue>> {
        let url = format!(
            "{}/repos/{}/{}/issues",
            self.api_base, self.repo.owner, self.repo.name
        );
        let rows: Vec<GithubIssue> = self
            .paginated("list issues", |page| {
                let page_value = page.to_string();
                self.http.get(&url).query(&[
                    ("state", "open"),
                    ("sort", "updated"),
                    ("direction", "asc"),
                    ("since", since),
                    ("per_page", "100"),
                    ("page", page_value.as_str()),
                ])
            })
            .await?;
        Ok(rows
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .collect())
    }

    async fn list_updated_pull_requests(&self, since: &str) -> Result<Vec<GithubPullRequest>> {
        let url = format!(
            "{}/repos/{}/{}/pulls",
            self.api_base, self.repo.owner, self.repo.name
        );
        let rows: Vec<GithubPullRequest> = self
            .paginated("list pull requests", |page| {
                let page_value = page.to_string();
                self.http.get(&url).query(&[
                    ("state", "open"),
                    ("sort", "updated"),
                    ("direction", "asc"),
                    ("per_page", "100"),
                    ("page", page_value.as_str()),
                ])
            })
            .await?;
        // The pulls endpoint has no `since` filter, so the watermark is
        // applied client-side on `updated_at`.
        Ok(rows
            .into_iter()
            .filter(|pull| is_updated_after(&pull.updated_at, since))
            .collect())
    }

    async fn list_issue_comments(&self, since: &str) -> Result<Vec<GithubComment>> {
        let url = format!(
            "{}/repos/{}/{}/issues/comments",
            self.api_base, self.repo.owner, self.repo.name
        );
        self.paginated("list issue comments", |page| {
            let page_value = page.to_string();
            self.http.get(&url).query(&[
                ("sort", "updated"),
                ("direction", "asc"),
                ("since", since),
                ("per_page", "100"),
                ("page", page_value.as_str()),
            ])
        })
        .await
    }

    async fn list_review_comments(&self, since: &str) -> Result<Vec<GithubComment>> {
        let url = format!(
            "{}/repos/{}/{}/pulls/comments",
            self.api_base, self.repo.owner, self.repo.name
        );
        self.paginated("list review comments", |page| {
            let page_value = page.to_string();
            self.http.get(&url).query(&[
                ("sort", "updated"),
                ("direction", "asc"),
                ("since", since),
                ("per_page", "100"),
                ("page", page_value.as_str()),
            ])
        })
        .await
    }

    async fn get_issue(&self, number: u64) -> Result<GithubIssue> {
        self.request_json("get issue", || {
            self.http.get(format!(
                "{}/repos/{}/{}/issues/{}",
                self.api_base, self.repo.owner, self.repo.name, number
            ))
        })
        .await
    }

    async fn get_pull_request(&self, number: u64) -> Result<GithubPullRequest> {
        self.request_json("get pull request", || {
            self.http.get(format!(
                "{}/repos/{}/{}/pulls/{}",
                self.api_base, self.repo.owner, self.repo.name, number
            ))
        })
        .await
    }

    async fn get_repository(&self) -> Result<GithubRepository> {
        self.request_json("get repository", || {
            self.http.get(format!(
                "{}/repos/{}/{}",
                self.api_base, self.repo.owner, self.repo.name
            ))
        })
        .await
    }

    async fn create_comment(&self, issue_number: u64, body: &str) -> Result<()> {
        let payload = serde_json::json!({ "body": body });
        let _: serde_json::Value = self
            .request_json("create comment", || {
                self.http
                    .post(format!(
                        "{}/repos/{}/{}/issues/{}/comments",
                        self.api_base, self.repo.owner, self.repo.name, issue_number
                    ))
                    .json(&payload)
            })
            .await?;
        Ok(())
    }
}

fn is_updated_after(updated_at: &str, since: &str) -> bool {
    let updated = DateTime::parse_from_rfc3339(updated_at).map(|value| value.with_timezone(&Utc));
    let watermark = DateTime::parse_from_rfc3339(since).map(|value| value.with_timezone(&Utc));
    match (updated, watermark) {
        (Ok(updated), Ok(watermark)) => updated > watermark,
        // Keep the row when either timestamp fails to parse rather than
        // silently dropping activity.
        _ => true,
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?;
    let seconds = raw.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}

fn retry_delay(base_delay_ms: u64, attempt: usize, retry_after: Option<Duration>) -> Duration {
    if let Some(delay) = retry_after {
        return delay.max(Duration::from_millis(base_delay_ms));
    }
    let exponent = attempt.saturating_sub(1).min(10) as u32;
    let scaled = base_delay_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(scaled.min(30_000))
}

fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn is_retryable_github_status(status: u16) -> bool {
    status == 429 || status >= 500
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn unit_parse_retry_after_parses_seconds_and_rejects_invalid_values() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("4"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(4)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("bad-value"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn unit_retry_delay_applies_retry_after_floor_and_exponential_backoff() {
        assert_eq!(
            retry_delay(200, 2, Some(Duration::from_millis(100))),
            Duration::from_millis(200)
        );
        assert_eq!(retry_delay(100, 1, None), Duration::from_millis(100));
        assert_eq!(retry_delay(100, 3, None), Duration::from_millis(400));
        assert_eq!(retry_delay(2_000, 11, None), Duration::from_millis(30_000));
    }

    #[test]
    fn unit_is_retryable_github_status_matches_expected_ranges() {
        assert!(is_retryable_github_status(429));
        assert!(is_retryable_github_status(500));
        assert!(!is_retryable_github_status(404));
        assert!(!is_retryable_github_status(403));
    }

    #[test]
    fn regression_truncate_for_error_respects_char_boundaries() {
        assert_eq!(truncate_for_error("ta🌊u", 3), "ta🌊...");
        assert_eq!(truncate_for_error("ok", 10), "ok");
    }

    #[test]
    fn unit_comment_parent_number_comes_from_api_url() {
        let comment = GithubComment {
            id: 1,
            body: Some("hi".to_string()),
            user: GithubUser {
                login: "alice".to_string(),
            },
            updated_at: "2024-06-01T00:00:00Z".to_string(),
            html_url: "https://github.com/o/r/issues/42#issuecomment-1".to_string(),
            issue_url: Some("https://api.github.com/repos/o/r/issues/42".to_string()),
            pull_request_url: None,
        };
        assert_eq!(comment.parent_number(), Some(42));

        let review = GithubComment {
            issue_url: None,
            pull_request_url: Some("https://api.github.com/repos/o/r/pulls/7".to_string()),
            ..comment.clone()
        };
        assert_eq!(review.parent_number(), Some(7));

        let orphan = GithubComment {
            issue_url: None,
            pull_request_url: None,
            ..comment
        };
        assert_eq!(orphan.parent_number(), None);
    }

    #[test]
    fn unit_client_side_watermark_filter_compares_timestamps() {
        assert!(is_updated_after(
            "2024-06-01T10:00:01Z",
            "2024-06-01T10:00:00Z"
        ));
        assert!(!is_updated_after(
            "2024-06-01T10:00:00Z",
            "2024-06-01T10:00:00Z"
        ));
        assert!(is_updated_after("not-a-timestamp", "2024-06-01T10:00:00Z"));
    }

    #[test]
    fn unit_issue_payload_decodes_pull_request_marker() {
        let raw = r#"{
            "id": 9,
            "number": 3,
            "title": "Add pagination",
            "body": null,
            "user": {"login": "bob"},
            "updated_at": "2024-06-01T00:00:00Z",
            "html_url": "https://github.com/o/r/pull/3",
            "pull_request": {"url": "https://api.github.com/repos/o/r/pulls/3"}
        }"#;
        let issue: GithubIssue = serde_json::from_str(raw).expect("decode");
        assert!(issue.pull_request.is_some());
        assert_eq!(issue.body, None);
    }
}
