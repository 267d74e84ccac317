//! Case-insensitive trigger-pattern matching for mention detection.

/// Matches content against a configured list of mention patterns
/// (for example `@claude`, `@claude-code`) without case sensitivity.
#[derive(Debug, Clone)]
pub struct MentionMatcher {
    patterns: Vec<String>,
}

impl MentionMatcher {
    /// Builds a matcher from raw patterns, dropping empty entries.
    pub fn new(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let patterns = patterns
            .into_iter()
            .map(|pattern| pattern.as_ref().trim().to_lowercase())
            .filter(|pattern| !pattern.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True when `content` contains any configured pattern, ignoring case.
    pub fn matches(&self, content: &str) -> bool {
        if content.is_empty() {
            return false;
        }
        let lowered = content.to_lowercase();
        self.patterns
            .iter()
            .any(|pattern| lowered.contains(pattern.as_str()))
    }
}
