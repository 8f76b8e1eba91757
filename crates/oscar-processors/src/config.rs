//! Explicit per-processor configuration and the shared skip filters.

use std::collections::BTreeSet;

use oscar_core::{Project, Timestamp};
use oscar_github::Issue;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Watcher name; instances sharing a name share a cursor.
    pub name: String,
    /// Projects this processor acts on.
    pub projects: BTreeSet<Project>,
    /// When false, the processor only logs what it would do and never
    /// advances its cursor.
    pub enabled: bool,
    /// Registered actions wait for human approval before execution.
    pub require_approval: bool,
    /// Skip issues created more than this many seconds ago.
    pub max_age_secs: Option<u64>,
    pub skip_authors: BTreeSet<String>,
    pub skip_title_prefixes: Vec<String>,
    pub skip_title_suffixes: Vec<String>,
    pub skip_body_substrings: Vec<String>,
}

impl ProcessorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            projects: BTreeSet::new(),
            enabled: false,
            require_approval: false,
            max_age_secs: None,
            skip_authors: BTreeSet::new(),
            skip_title_prefixes: vec![],
            skip_title_suffixes: vec![],
            skip_body_substrings: vec![],
        }
    }

    pub fn with_project(mut self, project: Project) -> Self {
        self.projects.insert(project);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn project_enabled(&self, project: &Project) -> bool {
        self.projects.contains(project)
    }

    pub fn author_skipped(&self, login: &str) -> bool {
        self.skip_authors.contains(login)
    }

    /// Why this issue should not be acted on, if any reason applies.
    /// Project membership is the caller's check; this covers the issue
    /// itself.
    pub fn skip_issue(&self, issue: &Issue, now: Timestamp) -> Option<&'static str> {
        if issue.is_pull_request() {
            return Some("pull request");
        }
        if self.author_skipped(&issue.user.login) {
            return Some("author skipped");
        }
        if self
            .skip_title_prefixes
            .iter()
            .any(|prefix| issue.title.starts_with(prefix))
        {
            return Some("title prefix skipped");
        }
        if self
            .skip_title_suffixes
            .iter()
            .any(|suffix| issue.title.ends_with(suffix))
        {
            return Some("title suffix skipped");
        }
        if self
            .skip_body_substrings
            .iter()
            .any(|needle| issue.body().contains(needle))
        {
            return Some("body content skipped");
        }
        if let Some(max_age) = self.max_age_secs {
            if max_age < now.secs_since(issue.created_time()) {
                return Some("too old");
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(title: &str, body: &str, author: &str) -> Issue {
        Issue {
            title: title.into(),
            body: Some(body.into()),
            user: oscar_github::User {
                login: author.into(),
            },
            created_at: "2024-01-01T00:00:00Z".into(),
            ..Default::default()
        }
    }

    #[test]
    fn skip_filters() {
        let mut config = ProcessorConfig::new("test");
        config.skip_authors.insert("gopherbot".into());
        config.skip_title_prefixes.push("x/".into());
        config.skip_title_suffixes.push("[frozen]".into());
        config.skip_body_substrings.push("DO NOT PROCESS".into());

        let now = Timestamp::from_rfc3339("2024-01-02T00:00:00Z").unwrap();
        assert_eq!(config.skip_issue(&issue("ok", "fine", "human"), now), None);
        assert_eq!(
            config.skip_issue(&issue("ok", "fine", "gopherbot"), now),
            Some("author skipped")
        );
        assert_eq!(
            config.skip_issue(&issue("x/tools: broken", "fine", "human"), now),
            Some("title prefix skipped")
        );
        assert_eq!(
            config.skip_issue(&issue("old bug [frozen]", "fine", "human"), now),
            Some("title suffix skipped")
        );
        assert_eq!(
            config.skip_issue(&issue("ok", "DO NOT PROCESS this", "human"), now),
            Some("body content skipped")
        );

        let pull = Issue {
            pull_request: Some(serde_json::json!({})),
            ..issue("ok", "fine", "human")
        };
        assert_eq!(config.skip_issue(&pull, now), Some("pull request"));
    }

    #[test]
    fn max_age_filter() {
        let mut config = ProcessorConfig::new("test");
        config.max_age_secs = Some(3600);

        let fresh = Timestamp::from_rfc3339("2024-01-01T00:30:00Z").unwrap();
        let stale = Timestamp::from_rfc3339("2024-01-03T00:00:00Z").unwrap();
        let subject = issue("ok", "fine", "human");
        assert_eq!(config.skip_issue(&subject, fresh), None);
        assert_eq!(config.skip_issue(&subject, stale), Some("too old"));
    }
}
