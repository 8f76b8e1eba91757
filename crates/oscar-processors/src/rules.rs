//! Rule checker: classifies an issue, evaluates the rules configured for
//! that kind, and posts one comment listing the violations.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use oscar_actions::{ActionLog, Actioner};
use oscar_ai::{AiError, Generator};
use oscar_core::error::{BoxedError, FmtCompact as _};
use oscar_core::{Project, Timestamp};
use oscar_db::Database;
use oscar_github::store::EventWatcher;
use oscar_github::{Issue, IssueSource, Typed};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::labels::classify;
use crate::{LOG_TARGET, ProcessorConfig, ProcessorResult, issue_action_key};

pub const ACTION_KIND: &str = "rules.Poster";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RulesConfig {
    pub issue_kinds: Vec<IssueKind>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IssueKind {
    pub name: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rule {
    pub text: String,
    pub details: String,
    #[serde(default)]
    pub regexp: Option<String>,
}

static RULES: LazyLock<RulesConfig> = LazyLock::new(|| {
    let config: RulesConfig = serde_json::from_str(include_str!("../config/rules.json"))
        .expect("embedded rules config is valid");
    for kind in &config.issue_kinds {
        for rule in &kind.rules {
            if let Some(regexp) = &rule.regexp {
                Regex::new(regexp).expect("embedded rule regexp compiles");
            }
        }
    }
    config
});

pub fn rules_config() -> &'static RulesConfig {
    &RULES
}

pub fn rules_for_kind(kind: &str) -> &'static [Rule] {
    RULES
        .issue_kinds
        .iter()
        .find(|issue_kind| issue_kind.name == kind)
        .map(|issue_kind| issue_kind.rules.as_slice())
        .unwrap_or(&[])
}

/// Evaluate one rule. Regexp rules match against the title and body;
/// everything else asks the model yes/no. Backend failures count as a pass
/// so flaky generation never produces accusatory comments.
async fn rule_passes(llm: &dyn Generator, issue: &Issue, rule: &Rule) -> bool {
    if let Some(regexp) = &rule.regexp {
        let re = Regex::new(regexp).expect("embedded rule regexp compiles");
        let doc = format!("{}\n{}", issue.title, issue.body());
        return re.is_match(&doc);
    }

    let prompt = format!(
        "Check an issue report against one rule.\n\
         Rule: {}\n{}\n\n\
         Issue title: {}\nIssue body:\n{}\n\n\
         Does the issue conform to the rule? Answer with the single word \
         yes or no.\n",
        rule.text,
        rule.details,
        issue.title,
        issue.body(),
    );
    match llm.generate(&prompt, None).await {
        Ok(answer) => !answer.trim().to_lowercase().starts_with("no"),
        Err(err) => {
            debug!(target: LOG_TARGET, err = %err.fmt_compact(), rule = %rule.text, "Rule check failed, treating as pass");
            true
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesAction {
    pub project: Project,
    pub issue: u64,
    pub body: String,
}

pub struct Rules {
    config: ProcessorConfig,
    watcher: EventWatcher,
}

impl Rules {
    pub async fn new(db: &Database, config: ProcessorConfig) -> ProcessorResult<Self> {
        let watcher = EventWatcher::github(db, &config.name).await?;
        Ok(Self { config, watcher })
    }

    pub async fn run(
        &mut self,
        db: &Database,
        actions: &ActionLog,
        llm: &dyn Generator,
    ) -> ProcessorResult<usize> {
        let now = Timestamp::now();
        let events = self.watcher.recent(db).await?;
        let mut registered = 0;

        for event in &events {
            let Typed::Issue(issue) = &event.typed else {
                continue;
            };
            if !self.config.project_enabled(&event.project) {
                continue;
            }
            if !issue.is_open() {
                continue;
            }
            if let Some(reason) = self.config.skip_issue(issue, now) {
                debug!(target: LOG_TARGET, project = %event.project, issue = issue.number, reason, "Rules skipping issue");
                continue;
            }

            let key = issue_action_key(&event.project, issue.number);
            if actions.get(ACTION_KIND, &key).await?.is_some() {
                self.advance(db, event.db_time).await?;
                continue;
            }

            // Classify first; rules are per-kind. Prefer the labeler's
            // stored verdict to keep the model idle.
            let kind = match crate::labels::read_categories(db, &event.project, issue.number)
                .await?
                .and_then(|categories| categories.into_iter().next())
            {
                Some(kind) => kind,
                None => match classify(llm, issue).await {
                    Ok(classification) => classification.category_name,
                    Err(err @ AiError::BadJson { .. }) => {
                        warn!(target: LOG_TARGET, project = %event.project, issue = issue.number, err = %err.fmt_compact(), "Rules got unusable classification");
                        self.advance(db, event.db_time).await?;
                        continue;
                    }
                    Err(err) => {
                        warn!(target: LOG_TARGET, project = %event.project, issue = issue.number, err = %err.fmt_compact(), "Rules backend failure");
                        continue;
                    }
                },
            };

            let mut failed = vec![];
            for rule in rules_for_kind(&kind) {
                if !rule_passes(llm, issue, rule).await {
                    failed.push(rule);
                }
            }
            if failed.is_empty() {
                self.advance(db, event.db_time).await?;
                continue;
            }

            let body = format_violations(&failed);
            info!(
                target: LOG_TARGET,
                project = %event.project,
                issue = issue.number,
                kind = %kind,
                violations = failed.len(),
                enabled = self.config.enabled,
                "Rules found violations"
            );
            if !self.config.enabled {
                continue;
            }

            let action = RulesAction {
                project: event.project.clone(),
                issue: issue.number,
                body,
            };
            actions
                .before(
                    ACTION_KIND,
                    &key,
                    serde_json::to_vec(&action).expect("action payload serializes"),
                    self.config.require_approval,
                )
                .await?;
            registered += 1;
            self.advance(db, event.db_time).await?;
        }

        Ok(registered)
    }

    async fn advance(&mut self, db: &Database, t: oscar_core::DbTime) -> ProcessorResult<()> {
        if self.config.enabled {
            self.watcher.mark_old(t);
            self.watcher.flush(db).await?;
        }
        Ok(())
    }
}

fn format_violations(failed: &[&Rule]) -> String {
    let mut body = String::from(
        "Hi! While triaging this issue I noticed some possible problems with it:\n\n",
    );
    for rule in failed {
        body.push_str(&format!(" - {}\n   {}\n", rule.text, rule.details));
    }
    body.push_str(
        "\nAddressing these will help maintainers act on the report. \
         (I'm a bot; sorry if this advice misses the mark.)\n",
    );
    body
}

/// Executes `rules.Poster` actions: posts the violation comment.
pub struct RulesActioner {
    source: Arc<dyn IssueSource>,
}

impl RulesActioner {
    pub fn new(source: Arc<dyn IssueSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Actioner for RulesActioner {
    async fn run(&self, payload: &[u8]) -> Result<Vec<u8>, BoxedError> {
        let action: RulesAction = serde_json::from_slice(payload)?;
        let url = self
            .source
            .post_comment(&action.project, action.issue, &action.body)
            .await?;
        Ok(url.into_bytes())
    }

    fn for_display(&self, payload: &[u8]) -> String {
        match serde_json::from_slice::<RulesAction>(payload) {
            Ok(action) => format!("post rule-check comment on {}#{}", action.project, action.issue),
            Err(_) => "rules.Poster (unreadable payload)".to_string(),
        }
    }
}
