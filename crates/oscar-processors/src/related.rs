//! Related-document poster: semantic search over the corpus, one Markdown
//! comment per issue.

use std::sync::Arc;

use async_trait::async_trait;
use oscar_actions::{ActionLog, Actioner};
use oscar_ai::docs::{DOCS, Document};
use oscar_ai::{Embedder, VectorDb, VectorResult};
use oscar_core::error::BoxedError;
use oscar_core::{Project, Timestamp};
use oscar_db::Database;
use oscar_github::store::EventWatcher;
use oscar_github::{IssueSource, Typed, issue_url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{LOG_TARGET, ProcessorConfig, ProcessorResult, issue_action_key};

pub const ACTION_KIND: &str = "related.Poster";

pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.4;
pub const DEFAULT_MAX_RESULTS: usize = 5;

/// What a search hit is, inferred from its URL; drives the grouping of the
/// posted comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ResultKind {
    Issue,
    CodeChange,
    Documentation,
    Discussion,
}

impl ResultKind {
    fn of(url: &str) -> Self {
        if url.contains("/issues/") {
            Self::Issue
        } else if url.contains("go-review.googlesource.com") || url.contains("/commit/") {
            Self::CodeChange
        } else if url.contains("/discussions/") {
            Self::Discussion
        } else {
            Self::Documentation
        }
    }

    fn heading(self) -> &'static str {
        match self {
            Self::Issue => "Related issues",
            Self::CodeChange => "Related code changes",
            Self::Documentation => "Related documentation",
            Self::Discussion => "Related discussions",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedAction {
    pub project: Project,
    pub issue: u64,
    pub body: String,
}

pub struct Related {
    config: ProcessorConfig,
    watcher: EventWatcher,
    pub score_threshold: f64,
    pub max_results: usize,
}

impl Related {
    pub async fn new(db: &Database, config: ProcessorConfig) -> ProcessorResult<Self> {
        let watcher = EventWatcher::github(db, &config.name).await?;
        Ok(Self {
            config,
            watcher,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            max_results: DEFAULT_MAX_RESULTS,
        })
    }

    pub async fn run(
        &mut self,
        db: &Database,
        actions: &ActionLog,
        embedder: &dyn Embedder,
        vector_db: &dyn VectorDb,
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
                debug!(target: LOG_TARGET, project = %event.project, issue = issue.number, reason, "Related skipping issue");
                continue;
            }

            let key = issue_action_key(&event.project, issue.number);
            if actions.get(ACTION_KIND, &key).await?.is_some() {
                self.advance(db, event.db_time).await?;
                continue;
            }

            let url = issue_url(&event.project, issue.number);
            // Prefer the corpus-aligned vector; fall back to embedding the
            // body directly when the index has not caught up.
            let vector = match vector_db.get(&url).await {
                Some(vector) => vector,
                None => {
                    let text = format!("{}\n{}", issue.title, issue.body());
                    let mut vectors = embedder.embed(&[text]).await?;
                    vectors.pop().expect("one embedding per input")
                }
            };

            let mut results = vector_db
                .search(&vector, self.score_threshold, self.max_results + 1)
                .await;
            results.retain(|result| result.id != url);
            results.truncate(self.max_results);

            if results.is_empty() {
                debug!(target: LOG_TARGET, project = %event.project, issue = issue.number, "No related documents above threshold");
                self.advance(db, event.db_time).await?;
                continue;
            }

            let body = format_comment(db, &results).await?;
            info!(
                target: LOG_TARGET,
                project = %event.project,
                issue = issue.number,
                results = results.len(),
                enabled = self.config.enabled,
                "Related found documents"
            );

            if !self.config.enabled {
                continue;
            }

            let action = RelatedAction {
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

/// Render search results as a Markdown comment, grouped by result kind.
/// Titles come from the corpus; results the corpus no longer has fall back
/// to their bare URL.
async fn format_comment(db: &Database, results: &[VectorResult]) -> ProcessorResult<String> {
    let mut groups: Vec<(ResultKind, Vec<String>)> = vec![];
    for result in results {
        let title = document_title(db, &result.id).await?;
        let line = match title {
            Some(title) if !title.is_empty() => {
                format!(" - [{title}]({}) ({:.2})", result.id, result.score)
            }
            _ => format!(" - {} ({:.2})", result.id, result.score),
        };
        let kind = ResultKind::of(&result.id);
        match groups.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, lines)) => lines.push(line),
            None => groups.push((kind, vec![line])),
        }
    }
    groups.sort_by_key(|(kind, _)| *kind);

    let mut body = String::from(
        "**Related content** (found by semantic search; correlation is not causation)\n",
    );
    for (kind, lines) in groups {
        body.push_str(&format!("\n{}:\n", kind.heading()));
        for line in lines {
            body.push_str(&line);
            body.push('\n');
        }
    }
    Ok(body)
}

async fn document_title(db: &Database, id: &str) -> ProcessorResult<Option<String>> {
    let id = id.to_string();
    let record = db.read_with(|tx| DOCS.get_tx(tx, &id)).await?;
    Ok(record
        .and_then(|record| serde_json::from_slice::<Document>(&record.raw).ok())
        .map(|document| document.title))
}

/// Executes `related.Poster` actions: posts the prepared comment.
pub struct RelatedActioner {
    source: Arc<dyn IssueSource>,
}

impl RelatedActioner {
    pub fn new(source: Arc<dyn IssueSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Actioner for RelatedActioner {
    async fn run(&self, payload: &[u8]) -> Result<Vec<u8>, BoxedError> {
        let action: RelatedAction = serde_json::from_slice(payload)?;
        let url = self
            .source
            .post_comment(&action.project, action.issue, &action.body)
            .await?;
        Ok(url.into_bytes())
    }

    fn for_display(&self, payload: &[u8]) -> String {
        match serde_json::from_slice::<RelatedAction>(payload) {
            Ok(action) => format!("post related-content comment on {}#{}", action.project, action.issue),
            Err(_) => "related.Poster (unreadable payload)".to_string(),
        }
    }
}
