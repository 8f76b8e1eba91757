//! Label classifier: asks the LLM for the issue's category and proposes the
//! mapped tracker label. Also keeps the tracker's label definitions in sync
//! with the configured set.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use oscar_actions::{ActionLog, Actioner};
use oscar_ai::{AiError, Generator, generate_json};
use oscar_core::error::{BoxedError, FmtCompact as _};
use oscar_core::{Project, Timestamp};
use oscar_db::{Database, def_table};
use oscar_github::store::EventWatcher;
use oscar_github::{Issue, IssueChanges, IssueSource, Label, Typed};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{LOG_TARGET, ProcessorConfig, ProcessorResult, issue_action_key};

pub const ACTION_KIND: &str = "labels.Labeler";

def_table! {
    /// Category names the classifier assigned, CSV per issue.
    labels_categories: (Project, u64) => String
}

/// One classifiable category and the tracker label it maps to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Category {
    pub name: String,
    pub label: String,
    pub description: String,
}

static CATEGORIES: LazyLock<Vec<Category>> = LazyLock::new(|| {
    serde_json::from_str(include_str!("../config/categories.json"))
        .expect("embedded categories config is valid")
});

pub fn categories() -> &'static [Category] {
    &CATEGORIES
}

pub fn category(name: &str) -> Option<&'static Category> {
    CATEGORIES.iter().find(|category| category.name == name)
}

/// The classifier's reply shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Classification {
    pub category_name: String,
    pub explanation: String,
}

fn classification_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "CategoryName": { "type": "string" },
            "Explanation": { "type": "string" },
        },
        "required": ["CategoryName", "Explanation"],
    })
}

fn classification_prompt(issue: &Issue) -> String {
    let mut prompt = String::from(
        "Classify the following issue report into exactly one category.\n\
         Reply with a JSON object {\"CategoryName\": ..., \"Explanation\": ...}.\n\
         \nCategories:\n",
    );
    for category in categories() {
        prompt.push_str(&format!("- {}: {}\n", category.name, category.description));
    }
    prompt.push_str(&format!(
        "\nIssue title: {}\nIssue body:\n{}\n",
        issue.title,
        issue.body()
    ));
    prompt
}

/// Ask the backend to classify an issue. Shared with the rule checker.
pub(crate) async fn classify(
    llm: &dyn Generator,
    issue: &Issue,
) -> Result<Classification, AiError> {
    generate_json(llm, &classification_prompt(issue), &classification_schema()).await
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelerAction {
    pub project: Project,
    pub issue: u64,
    pub categories: Vec<String>,
    pub new_labels: Vec<String>,
}

pub struct Labeler {
    config: ProcessorConfig,
    watcher: EventWatcher,
}

impl Labeler {
    pub async fn new(db: &Database, config: ProcessorConfig) -> ProcessorResult<Self> {
        db.write_with(|tx| {
            let _ = tx.open_table(&labels_categories::TABLE)?;
            Ok(())
        })
        .await?;
        let watcher = EventWatcher::github(db, &config.name).await?;
        Ok(Self { config, watcher })
    }

    /// One pass over new issue events. Returns the number of actions
    /// registered.
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
                debug!(target: LOG_TARGET, project = %event.project, issue = issue.number, reason, "Labeler skipping issue");
                continue;
            }

            let key = issue_action_key(&event.project, issue.number);
            if actions.get(ACTION_KIND, &key).await?.is_some() {
                self.advance(db, event.db_time).await?;
                continue;
            }

            let classification = match classify(llm, issue).await {
                Ok(classification) => classification,
                Err(err @ AiError::BadJson { .. }) => {
                    // Content error: skip the issue for good.
                    warn!(target: LOG_TARGET, project = %event.project, issue = issue.number, err = %err.fmt_compact(), "Labeler got unusable classification");
                    self.advance(db, event.db_time).await?;
                    continue;
                }
                Err(err) => {
                    // Transport-shaped: leave the cursor so the next run
                    // retries this issue.
                    warn!(target: LOG_TARGET, project = %event.project, issue = issue.number, err = %err.fmt_compact(), "Labeler backend failure");
                    continue;
                }
            };

            let Some(category) = category(&classification.category_name) else {
                warn!(
                    target: LOG_TARGET,
                    project = %event.project,
                    issue = issue.number,
                    category = %classification.category_name,
                    "Classifier chose an unknown category"
                );
                self.advance(db, event.db_time).await?;
                continue;
            };

            info!(
                target: LOG_TARGET,
                project = %event.project,
                issue = issue.number,
                category = %category.name,
                label = %category.label,
                explanation = %classification.explanation,
                enabled = self.config.enabled,
                "Labeler classified issue"
            );

            if !self.config.enabled {
                continue;
            }

            write_categories(db, &event.project, issue.number, &[category.name.clone()]).await?;

            let action = LabelerAction {
                project: event.project.clone(),
                issue: issue.number,
                categories: vec![category.name.clone()],
                new_labels: vec![category.label.clone()],
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

    /// Reset the cursor to re-examine the whole event log.
    pub async fn restart(&mut self, db: &Database) -> ProcessorResult<()> {
        self.watcher.restart(db).await?;
        Ok(())
    }
}

async fn write_categories(
    db: &Database,
    project: &Project,
    issue: u64,
    names: &[String],
) -> ProcessorResult<()> {
    let key = (project.clone(), issue);
    let csv = names.join(",");
    db.write_with(|tx| {
        let mut table = tx.open_table(&labels_categories::TABLE)?;
        table.insert(&key, &csv)?;
        Ok(())
    })
    .await?;
    Ok(())
}

/// The classifier's stored verdict for an issue, if any.
pub async fn read_categories(
    db: &Database,
    project: &Project,
    issue: u64,
) -> ProcessorResult<Option<Vec<String>>> {
    let key = (project.clone(), issue);
    let csv = db
        .read_with(|tx| {
            let table = tx.open_table(&labels_categories::TABLE)?;
            Ok(table.get(&key)?.map(|guard| guard.value()))
        })
        .await?;
    Ok(csv.map(|csv| csv.split(',').map(str::to_string).collect()))
}

/// Executes `labels.Labeler` actions: re-reads the live label set (the
/// tracker replaces labels rather than adding) and writes back the union.
pub struct LabelerActioner {
    source: Arc<dyn IssueSource>,
}

impl LabelerActioner {
    pub fn new(source: Arc<dyn IssueSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Actioner for LabelerActioner {
    async fn run(&self, payload: &[u8]) -> Result<Vec<u8>, BoxedError> {
        let action: LabelerAction = serde_json::from_slice(payload)?;

        let issue = self
            .source
            .read_issue(&action.project, action.issue)
            .await?;
        let mut labels: BTreeSet<String> = issue
            .labels
            .iter()
            .map(|label| label.name.clone())
            .collect();
        labels.extend(action.new_labels.iter().cloned());
        let labels: Vec<String> = labels.into_iter().collect();

        self.source
            .edit_issue(
                &action.project,
                action.issue,
                &IssueChanges {
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(serde_json::to_vec(&serde_json::json!({ "labels": labels }))?)
    }

    fn for_display(&self, payload: &[u8]) -> String {
        match serde_json::from_slice::<LabelerAction>(payload) {
            Ok(action) => format!(
                "label {}#{} as {}",
                action.project,
                action.issue,
                action.new_labels.join(", ")
            ),
            Err(_) => "labels.Labeler (unreadable payload)".to_string(),
        }
    }
}

/// Align the tracker's label definitions with the configured categories:
/// create missing labels, fill empty descriptions, and only warn about
/// conflicting ones.
pub async fn sync_labels(
    source: &dyn IssueSource,
    projects: impl IntoIterator<Item = &Project>,
) -> ProcessorResult<()> {
    for project in projects {
        let existing = source.list_labels(project).await?;
        for category in categories() {
            let wanted = Label {
                name: category.label.clone(),
                description: Some(category.description.clone()),
                color: Some("ededed".to_string()),
            };
            match existing.iter().find(|label| label.name == category.label) {
                None => {
                    info!(target: LOG_TARGET, %project, label = %category.label, "Creating missing label");
                    source.create_label(project, &wanted).await?;
                }
                Some(label) if label.description.as_deref().unwrap_or("").is_empty() => {
                    info!(target: LOG_TARGET, %project, label = %category.label, "Filling empty label description");
                    source
                        .update_label(project, &category.label, &wanted)
                        .await?;
                }
                Some(label) if label.description.as_deref() != Some(&category.description) => {
                    warn!(
                        target: LOG_TARGET,
                        %project,
                        label = %category.label,
                        upstream = %label.description.as_deref().unwrap_or(""),
                        "Label description differs from configuration, leaving it alone"
                    );
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}
