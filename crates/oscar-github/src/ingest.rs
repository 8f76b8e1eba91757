//! Incremental mirror of issue activity over REST.
//!
//! Each project keeps a per-kind watermark: the newest upstream `updated`
//! time already mirrored. The issue endpoints all page in descending update
//! order, so a walk stops early at the first item at or below the
//! watermark. Watermarks advance only after a kind's walk completes; an
//! interrupted sync re-covers the same pages, and re-ingesting is
//! idempotent at the store level.

use std::sync::Arc;

use bincode::{Decode, Encode};
use oscar_core::{Project, Timestamp};
use oscar_db::timed::TimedBatch;
use oscar_db::{Database, def_table};
use serde_json::Value;
use snafu::ResultExt as _;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::store::GITHUB_EVENTS;
use crate::types::{ApiKind, EventKey};
use crate::{DecodeSnafu, GithubResult, LOG_TARGET};

const PER_PAGE: usize = 100;

/// Hard cap per kind per sync; anything deeper waits for the next cadence.
const MAX_PAGES: usize = 200;

def_table! {
    /// Per-project issue sync watermarks.
    github_sync: Project => ProjectSyncState
}

#[derive(Debug, Encode, Decode, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectSyncState {
    pub issues: Timestamp,
    pub issue_comments: Timestamp,
    pub issue_events: Timestamp,
}

impl ProjectSyncState {
    fn get(&self, api: ApiKind) -> Timestamp {
        match api {
            ApiKind::Issues => self.issues,
            ApiKind::IssueComments => self.issue_comments,
            ApiKind::IssueEvents => self.issue_events,
            ApiKind::Discussions | ApiKind::DiscussionComments => {
                unreachable!("discussion kinds are not issue-synced")
            }
        }
    }

    fn set(&mut self, api: ApiKind, watermark: Timestamp) {
        match api {
            ApiKind::Issues => self.issues = watermark,
            ApiKind::IssueComments => self.issue_comments = watermark,
            ApiKind::IssueEvents => self.issue_events = watermark,
            ApiKind::Discussions | ApiKind::DiscussionComments => {
                unreachable!("discussion kinds are not issue-synced")
            }
        }
    }
}

pub struct IssuesIngestor {
    client: Arc<Client>,
    projects: Vec<Project>,
}

impl IssuesIngestor {
    pub fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            projects: vec![],
        }
    }

    pub fn add(&mut self, project: Project) {
        if !self.projects.contains(&project) {
            self.projects.push(project);
        }
    }

    pub fn contains(&self, project: &Project) -> bool {
        self.projects.contains(project)
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub async fn sync(&self, db: &Database) -> GithubResult<()> {
        for project in &self.projects {
            self.sync_project(db, project).await?;
        }
        Ok(())
    }

    pub async fn sync_project(&self, db: &Database, project: &Project) -> GithubResult<()> {
        let _guard = db
            .locks()
            .lock(&format!("github.SyncProject/{project}"))
            .await;
        info!(target: LOG_TARGET, %project, "Syncing issue events");

        for api in [ApiKind::Issues, ApiKind::IssueComments, ApiKind::IssueEvents] {
            let state = read_sync_state(db, project).await?;
            let watermark = state.get(api);
            let newest = self.sync_kind(db, project, api, watermark).await?;
            if watermark < newest {
                let mut updated = read_sync_state(db, project).await?;
                updated.set(api, newest);
                write_sync_state(db, project, updated).await?;
            }
        }
        Ok(())
    }

    async fn sync_kind(
        &self,
        db: &Database,
        project: &Project,
        api: ApiKind,
        watermark: Timestamp,
    ) -> GithubResult<Timestamp> {
        let mut batch = TimedBatch::new(&GITHUB_EVENTS);
        let mut newest = watermark;

        for page in 1..=MAX_PAGES {
            let url = self.client.api_url(&kind_page_path(project, api, page));
            let value = self.client.get_json(&url).await?;
            let items: Vec<Value> = serde_json::from_value(value).context(DecodeSnafu)?;
            if items.is_empty() {
                break;
            }
            let page_len = items.len();

            let outcome = apply_items(db, &mut batch, project, api, &items, watermark).await?;
            newest = newest.max(outcome.newest);
            if outcome.reached_watermark || page_len < PER_PAGE {
                break;
            }
        }

        batch.apply(db).await?;
        debug!(
            target: LOG_TARGET,
            %project,
            api = %api,
            newest = %newest,
            "Finished kind sync"
        );
        Ok(newest)
    }
}

pub(crate) struct ApplyOutcome {
    pub newest: Timestamp,
    /// True when an item at or below the watermark was seen; pages beyond
    /// it hold nothing new.
    pub reached_watermark: bool,
}

/// Write the page items newer than the watermark into the batch. Items
/// missing required fields are logged and skipped, never fatal.
pub(crate) async fn apply_items(
    db: &Database,
    batch: &mut TimedBatch<EventKey>,
    project: &Project,
    api: ApiKind,
    items: &[Value],
    watermark: Timestamp,
) -> GithubResult<ApplyOutcome> {
    let mut outcome = ApplyOutcome {
        newest: watermark,
        reached_watermark: false,
    };
    for item in items {
        let Some((key, updated)) = event_key_for(project, api, item) else {
            warn!(target: LOG_TARGET, %project, api = %api, "Skipping upstream item without key fields");
            continue;
        };
        if updated <= watermark {
            outcome.reached_watermark = true;
            break;
        }
        outcome.newest = outcome.newest.max(updated);
        batch.set(key, serde_json::to_vec(item).context(DecodeSnafu)?);
        batch.maybe_apply(db).await?;
    }
    Ok(outcome)
}

/// Extract `(event key, updated time)` from one upstream item.
pub(crate) fn event_key_for(
    project: &Project,
    api: ApiKind,
    item: &Value,
) -> Option<(EventKey, Timestamp)> {
    let (issue, id, time_field) = match api {
        ApiKind::Issues => {
            let number = item.get("number")?.as_u64()?;
            (number, number, "updated_at")
        }
        ApiKind::IssueComments => {
            let id = item.get("id")?.as_u64()?;
            let issue = item
                .get("issue_url")?
                .as_str()?
                .rsplit('/')
                .next()?
                .parse()
                .ok()?;
            (issue, id, "updated_at")
        }
        ApiKind::IssueEvents => {
            let id = item.get("id")?.as_u64()?;
            let issue = item.get("issue")?.get("number")?.as_u64()?;
            (issue, id, "created_at")
        }
        ApiKind::Discussions | ApiKind::DiscussionComments => return None,
    };
    let updated = Timestamp::from_rfc3339(item.get(time_field)?.as_str()?).ok()?;
    Some(((project.clone(), issue, api, id), updated))
}

fn kind_page_path(project: &Project, api: ApiKind, page: usize) -> String {
    match api {
        ApiKind::Issues => format!(
            "/repos/{project}/issues?state=all&sort=updated&direction=desc&per_page={PER_PAGE}&page={page}"
        ),
        ApiKind::IssueComments => format!(
            "/repos/{project}/issues/comments?sort=updated&direction=desc&per_page={PER_PAGE}&page={page}"
        ),
        ApiKind::IssueEvents => {
            format!("/repos/{project}/issues/events?per_page={PER_PAGE}&page={page}")
        }
        ApiKind::Discussions | ApiKind::DiscussionComments => {
            unreachable!("discussion kinds are not issue-synced")
        }
    }
}

pub async fn read_sync_state(db: &Database, project: &Project) -> GithubResult<ProjectSyncState> {
    Ok(db
        .read_with(|tx| {
            let table = tx.open_table(&github_sync::TABLE)?;
            Ok(table
                .get(project)?
                .map(|guard| guard.value())
                .unwrap_or_default())
        })
        .await?)
}

async fn write_sync_state(
    db: &Database,
    project: &Project,
    state: ProjectSyncState,
) -> GithubResult<()> {
    Ok(db
        .write_with(|tx| {
            let mut table = tx.open_table(&github_sync::TABLE)?;
            table.insert(project, &state)?;
            Ok(())
        })
        .await?)
}
