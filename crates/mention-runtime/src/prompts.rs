//! Prompt templates, one per item kind, with `{{NAME}}` substitution.
//!
//! Built-in defaults ship with the crate; a template directory can override
//! any of them file-by-file.

use std::path::Path;

use anyhow::{Context, Result};
use mention_store::ItemKind;

use crate::config::RepoRef;
use crate::scanner::MentionEvent;

const DEFAULT_ISSUE: &str = include_str!("../templates/issue.txt");
const DEFAULT_ISSUE_COMMENT: &str = include_str!("../templates/issue_comment.txt");
const DEFAULT_PR: &str = include_str!("../templates/pr.txt");
const DEFAULT_PR_COMMENT: &str = include_str!("../templates/pr_comment.txt");

/// File names looked up in a template override directory.
pub fn template_file_name(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Issue => "issue.txt",
        ItemKind::IssueComment => "issue_comment.txt",
        ItemKind::Pr => "pr.txt",
        ItemKind::PrComment => "pr_comment.txt",
    }
}

/// Built-in template text for `kind`.
pub fn default_template(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Issue => DEFAULT_ISSUE,
        ItemKind::IssueComment => DEFAULT_ISSUE_COMMENT,
        ItemKind::Pr => DEFAULT_PR,
        ItemKind::PrComment => DEFAULT_PR_COMMENT,
    }
}

/// Extra context fetched from the hosting api at dispatch time. Everything
/// is optional; prompts render with whatever is available.
#[derive(Debug, Clone, Default)]
pub struct ItemDetail {
    pub title: Option<String>,
    pub state: Option<String>,
    pub labels: Vec<String>,
    pub base_branch: Option<String>,
    pub head_branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PromptLibrary {
    issue: String,
    issue_comment: String,
    pr: String,
    pr_comment: String,
}

impl PromptLibrary {
    /// Library of the four built-in templates.
    pub fn builtin() -> Self {
        Self {
            issue: DEFAULT_ISSUE.to_string(),
            issue_comment: DEFAULT_ISSUE_COMMENT.to_string(),
            pr: DEFAULT_PR.to_string(),
            pr_comment: DEFAULT_PR_COMMENT.to_string(),
        }
    }

    /// Loads templates from `dir`, falling back to the built-in text for
    /// any file that is absent. A present-but-unreadable file is an error.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let Some(dir) = dir else {
            return Ok(Self::builtin());
        };
        let mut library = Self::builtin();
        for kind in [
            ItemKind::Issue,
            ItemKind::IssueComment,
            ItemKind::Pr,
            ItemKind::PrComment,
        ] {
            let path = dir.join(template_file_name(kind));
            if path.exists() {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read template {}", path.display()))?;
                *library.slot_mut(kind) = text;
            }
        }
        Ok(library)
    }

    fn slot(&self, kind: ItemKind) -> &str {
        match kind {
            ItemKind::Issue => &self.issue,
            ItemKind::IssueComment => &self.issue_comment,
            ItemKind::Pr => &self.pr,
            ItemKind::PrComment => &self.pr_comment,
        }
    }

    fn slot_mut(&mut self, kind: ItemKind) -> &mut String {
        match kind {
            ItemKind::Issue => &mut self.issue,
            ItemKind::IssueComment => &mut self.issue_comment,
            ItemKind::Pr => &mut self.pr,
            ItemKind::PrComment => &mut self.pr_comment,
        }
    }

    /// Renders the prompt for one mention event.
    pub fn render(&self, event: &MentionEvent, repo: &RepoRef) -> String {
        self.render_with_detail(event, repo, None)
    }

    /// Renders the prompt for one mention event, folding in detail fetched
    /// from the hosting api when the dispatcher could obtain it.
    pub fn render_with_detail(
        &self,
        event: &MentionEvent,
        repo: &RepoRef,
        detail: Option<&ItemDetail>,
    ) -> String {
        let number = event
            .number
            .map(|value| value.to_string())
            .unwrap_or_default();
        let title = event
            .title
            .clone()
            .or_else(|| detail.and_then(|detail| detail.title.clone()))
            .unwrap_or_default();
        let mut variables: Vec<(&str, String)> = match event.kind {
            ItemKind::Issue => vec![
                ("REPO", repo.full_name()),
                ("ISSUE_NUMBER", number),
                ("ISSUE_TITLE", title),
                ("ISSUE_BODY", event.content.clone()),
                ("ISSUE_AUTHOR", event.author.clone()),
                ("ISSUE_URL", event.html_url.clone()),
            ],
            ItemKind::IssueComment => vec![
                ("REPO", repo.full_name()),
                ("ISSUE_NUMBER", number),
                ("COMMENT_BODY", event.content.clone()),
                ("COMMENT_AUTHOR", event.author.clone()),
                ("COMMENT_URL", event.html_url.clone()),
            ],
            ItemKind::Pr => vec![
                ("REPO", repo.full_name()),
                ("PR_NUMBER", number),
                ("PR_TITLE", title),
                ("PR_BODY", event.content.clone()),
                ("PR_AUTHOR", event.author.clone()),
                ("PR_URL", event.html_url.clone()),
            ],
            ItemKind::PrComment => vec![
                ("REPO", repo.full_name()),
                ("PR_NUMBER", number),
                ("COMMENT_BODY", event.content.clone()),
                ("COMMENT_AUTHOR", event.author.clone()),
                ("COMMENT_URL", event.html_url.clone()),
            ],
        };
        if let Some(detail) = detail {
            if let Some(state) = &detail.state {
                let name = match event.kind {
                    ItemKind::Issue | ItemKind::IssueComment => "ISSUE_STATE",
                    ItemKind::Pr | ItemKind::PrComment => "PR_STATE",
                };
                variables.push((name, state.clone()));
            }
            if !detail.labels.is_empty() {
                variables.push(("ISSUE_LABELS", detail.labels.join(", ")));
            }
            if let Some(base) = &detail.base_branch {
                variables.push(("PR_BASE_BRANCH", base.clone()));
            }
            if let Some(head) = &detail.head_branch {
                variables.push(("PR_HEAD_BRANCH", head.clone()));
            }
        }
        render_template(self.slot(event.kind), &variables)
    }
}

/// Substitutes every `{{NAME}}` placeholder. Placeholders with no matching
/// variable stay in place and are logged, so a template typo is visible.
pub fn render_template(template: &str, variables: &[(&str, String)]) -> String {
    let mut rendered = template.to_string();
    for (name, value) in variables {
        rendered = rendered.replace(&format!("{{{{{name}}}}}"), value);
    }
    if rendered.contains("{{") {
        tracing::warn!("prompt template has unresolved placeholders");
    }
    rendered
}
