//! Incremental mirror of discussion activity over paginated GraphQL.
//!
//! Discussions page in descending update order, so the walk stops early at
//! the watermark like the REST ingestor. Comment and reply order inside a
//! discussion is unspecified: every node of a still-new discussion is
//! walked, and only those newer than the comment watermark are written.

use std::sync::Arc;

use bincode::{Decode, Encode};
use oscar_core::{Project, Timestamp};
use oscar_db::timed::TimedBatch;
use oscar_db::{Database, def_table};
use serde_json::Value;
use snafu::OptionExt as _;
use snafu::ResultExt as _;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::store::DISCUSSION_EVENTS;
use crate::types::{ApiKind, EventKey};
use crate::{DecodeSnafu, GithubResult, LOG_TARGET, MissingFieldSnafu};

const MAX_PAGES: usize = 100;

const DISCUSSIONS_QUERY: &str = r#"
query($owner: String!, $name: String!, $cursor: String) {
  repository(owner: $owner, name: $name) {
    discussions(first: 50, after: $cursor, orderBy: {field: UPDATED_AT, direction: DESC}) {
      pageInfo { hasNextPage endCursor }
      nodes {
        number title body url createdAt updatedAt
        author { login }
        comments(first: 100) {
          nodes {
            databaseId body url createdAt updatedAt
            author { login }
            replies(first: 100) {
              nodes {
                databaseId body url createdAt updatedAt
                author { login }
              }
            }
          }
        }
      }
    }
  }
}
"#;

def_table! {
    /// Per-project discussion sync watermarks.
    discussion_sync: Project => DiscussionSyncState
}

#[derive(Debug, Encode, Decode, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscussionSyncState {
    pub discussions: Timestamp,
    pub comments: Timestamp,
}

pub struct DiscussionsIngestor {
    client: Arc<Client>,
    projects: Vec<Project>,
}

impl DiscussionsIngestor {
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

    pub async fn sync(&self, db: &Database) -> GithubResult<()> {
        for project in &self.projects {
            self.sync_project(db, project).await?;
        }
        Ok(())
    }

    pub async fn sync_project(&self, db: &Database, project: &Project) -> GithubResult<()> {
        let _guard = db
            .locks()
            .lock(&format!("discussion.SyncProject/{project}"))
            .await;
        info!(target: LOG_TARGET, %project, "Syncing discussion events");

        let state = read_sync_state(db, project).await?;
        let mut batch = TimedBatch::new(&DISCUSSION_EVENTS);
        let mut newest = state;
        let mut cursor: Option<String> = None;

        'pages: for _ in 0..MAX_PAGES {
            let variables = serde_json::json!({
                "owner": project.owner(),
                "name": project.repo(),
                "cursor": cursor,
            });
            let response = self.client.graphql(DISCUSSIONS_QUERY, variables).await?;
            let connection = response
                .pointer("/data/repository/discussions")
                .context(MissingFieldSnafu {
                    field: "data.repository.discussions",
                })?;
            let nodes = connection
                .pointer("/nodes")
                .and_then(Value::as_array)
                .context(MissingFieldSnafu {
                    field: "discussions.nodes",
                })?;

            for node in nodes {
                let outcome = apply_discussion_node(db, &mut batch, project, node, state).await?;
                newest.discussions = newest.discussions.max(outcome.discussions);
                newest.comments = newest.comments.max(outcome.comments);
                if outcome.reached_watermark {
                    break 'pages;
                }
            }

            let page_info = connection.pointer("/pageInfo").context(MissingFieldSnafu {
                field: "discussions.pageInfo",
            })?;
            if page_info.pointer("/hasNextPage").and_then(Value::as_bool) != Some(true) {
                break;
            }
            cursor = page_info
                .pointer("/endCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        batch.apply(db).await?;
        if state != newest {
            write_sync_state(db, project, newest).await?;
        }
        debug!(
            target: LOG_TARGET,
            %project,
            discussions = %newest.discussions,
            comments = %newest.comments,
            "Finished discussion sync"
        );
        Ok(())
    }
}

pub(crate) struct DiscussionOutcome {
    pub discussions: Timestamp,
    pub comments: Timestamp,
    pub reached_watermark: bool,
}

/// Write one discussion node and its (unordered) comments and replies.
pub(crate) async fn apply_discussion_node(
    db: &Database,
    batch: &mut TimedBatch<EventKey>,
    project: &Project,
    node: &Value,
    state: DiscussionSyncState,
) -> GithubResult<DiscussionOutcome> {
    let mut outcome = DiscussionOutcome {
        discussions: state.discussions,
        comments: state.comments,
        reached_watermark: false,
    };

    let Some(number) = node.get("number").and_then(Value::as_u64) else {
        warn!(target: LOG_TARGET, %project, "Skipping discussion node without number");
        return Ok(outcome);
    };
    let Some(updated) = node
        .get("updatedAt")
        .and_then(Value::as_str)
        .and_then(|value| Timestamp::from_rfc3339(value).ok())
    else {
        warn!(target: LOG_TARGET, %project, number, "Skipping discussion node without updatedAt");
        return Ok(outcome);
    };

    // Any activity in a discussion bumps its updatedAt, so a discussion at
    // or below the watermark has nothing new underneath it either.
    if updated <= state.discussions {
        outcome.reached_watermark = true;
        return Ok(outcome);
    }
    outcome.discussions = outcome.discussions.max(updated);

    let mut discussion_only = node.clone();
    if let Some(object) = discussion_only.as_object_mut() {
        object.remove("comments");
    }
    batch.set(
        (project.clone(), number, ApiKind::Discussions, number),
        serde_json::to_vec(&discussion_only).context(DecodeSnafu)?,
    );
    batch.maybe_apply(db).await?;

    let comment_nodes = node
        .pointer("/comments/nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for comment in &comment_nodes {
        apply_comment_node(db, batch, project, number, comment, state.comments, &mut outcome)
            .await?;
        let reply_nodes = comment
            .pointer("/replies/nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for reply in &reply_nodes {
            apply_comment_node(db, batch, project, number, reply, state.comments, &mut outcome)
                .await?;
        }
    }
    Ok(outcome)
}

async fn apply_comment_node(
    db: &Database,
    batch: &mut TimedBatch<EventKey>,
    project: &Project,
    discussion: u64,
    comment: &Value,
    watermark: Timestamp,
    outcome: &mut DiscussionOutcome,
) -> GithubResult<()> {
    let Some(id) = comment.get("databaseId").and_then(Value::as_u64) else {
        warn!(target: LOG_TARGET, %project, discussion, "Skipping comment node without databaseId");
        return Ok(());
    };
    let Some(updated) = comment
        .get("updatedAt")
        .and_then(Value::as_str)
        .and_then(|value| Timestamp::from_rfc3339(value).ok())
    else {
        warn!(target: LOG_TARGET, %project, discussion, id, "Skipping comment node without updatedAt");
        return Ok(());
    };
    if updated <= watermark {
        return Ok(());
    }
    outcome.comments = outcome.comments.max(updated);

    let mut comment_only = comment.clone();
    if let Some(object) = comment_only.as_object_mut() {
        object.remove("replies");
    }
    batch.set(
        (
            project.clone(),
            discussion,
            ApiKind::DiscussionComments,
            id,
        ),
        serde_json::to_vec(&comment_only).context(DecodeSnafu)?,
    );
    batch.maybe_apply(db).await?;
    Ok(())
}

pub async fn read_sync_state(
    db: &Database,
    project: &Project,
) -> GithubResult<DiscussionSyncState> {
    Ok(db
        .read_with(|tx| {
            let table = tx.open_table(&discussion_sync::TABLE)?;
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
    state: DiscussionSyncState,
) -> GithubResult<()> {
    Ok(db
        .write_with(|tx| {
            let mut table = tx.open_table(&discussion_sync::TABLE)?;
            table.insert(project, &state)?;
            Ok(())
        })
        .await?)
}

#[cfg(test)]
mod tests {
    use oscar_core::error::BoxedErrorResult;

    use super::*;
    use crate::store::{self, DISCUSSION_EVENTS};
    use crate::types::Typed;

    fn discussion_node(number: u64, updated_at: &str, comments: Vec<Value>) -> Value {
        serde_json::json!({
            "number": number,
            "title": format!("discussion {number}"),
            "body": "opening post",
            "url": format!("https://github.com/golang/go/discussions/{number}"),
            "author": {"login": "gopher"},
            "createdAt": updated_at,
            "updatedAt": updated_at,
            "comments": {"nodes": comments},
        })
    }

    fn comment_node(id: u64, updated_at: &str, replies: Vec<Value>) -> Value {
        serde_json::json!({
            "databaseId": id,
            "body": "a comment",
            "url": format!("https://github.com/golang/go/discussions/1#discussioncomment-{id}"),
            "author": {"login": "gopher"},
            "createdAt": updated_at,
            "updatedAt": updated_at,
            "replies": {"nodes": replies},
        })
    }

    async fn temp_db() -> BoxedErrorResult<Database> {
        let db = Database::new_in_memory().await?;
        store::init_tables(&db).await?;
        Ok(db)
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn discussion_node_writes_discussion_comments_and_replies() -> BoxedErrorResult<()> {
        let db = temp_db().await?;
        let project = Project::new("golang/go")?;

        let node = discussion_node(
            1,
            "2024-01-05T00:00:00Z",
            vec![comment_node(
                100,
                "2024-01-04T00:00:00Z",
                vec![comment_node(101, "2024-01-05T00:00:00Z", vec![])],
            )],
        );

        let mut batch = TimedBatch::new(&DISCUSSION_EVENTS);
        let outcome = apply_discussion_node(
            &db,
            &mut batch,
            &project,
            &node,
            DiscussionSyncState::default(),
        )
        .await?;
        batch.apply(&db).await?;

        assert!(!outcome.reached_watermark);
        assert_eq!(
            outcome.discussions,
            Timestamp::from_rfc3339("2024-01-05T00:00:00Z")?
        );

        let entries = db
            .read_with(|tx| DISCUSSION_EVENTS.scan_by_time_tx(tx, oscar_core::DbTime::ZERO))
            .await?;
        assert_eq!(entries.len(), 3);

        // The stored discussion decodes through the typed model and does not
        // drag its comment tree along.
        let discussion_entry = entries
            .iter()
            .find(|entry| entry.key.2 == ApiKind::Discussions)
            .expect("discussion stored");
        let event = store::decode_event(discussion_entry)?;
        let Typed::Discussion(discussion) = event.typed else {
            panic!("expected discussion");
        };
        assert_eq!(discussion.number, 1);
        assert!(event.json.get("comments").is_none());
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn old_comments_are_not_rewritten() -> BoxedErrorResult<()> {
        let db = temp_db().await?;
        let project = Project::new("golang/go")?;

        let state = DiscussionSyncState {
            discussions: Timestamp::ZERO,
            comments: Timestamp::from_rfc3339("2024-01-04T12:00:00Z")?,
        };
        let node = discussion_node(
            1,
            "2024-01-05T00:00:00Z",
            vec![
                comment_node(100, "2024-01-04T00:00:00Z", vec![]),
                comment_node(102, "2024-01-05T00:00:00Z", vec![]),
            ],
        );

        let mut batch = TimedBatch::new(&DISCUSSION_EVENTS);
        apply_discussion_node(&db, &mut batch, &project, &node, state).await?;
        batch.apply(&db).await?;

        let entries = db
            .read_with(|tx| DISCUSSION_EVENTS.scan_by_time_tx(tx, oscar_core::DbTime::ZERO))
            .await?;
        // The discussion itself plus only the newer comment.
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|entry| entry.key.3 == 102));
        assert!(!entries.iter().any(|entry| entry.key.3 == 100));
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn watermarked_discussion_stops_the_walk() -> BoxedErrorResult<()> {
        let db = temp_db().await?;
        let project = Project::new("golang/go")?;

        let state = DiscussionSyncState {
            discussions: Timestamp::from_rfc3339("2024-01-05T00:00:00Z")?,
            comments: Timestamp::ZERO,
        };
        let node = discussion_node(1, "2024-01-05T00:00:00Z", vec![]);

        let mut batch = TimedBatch::new(&DISCUSSION_EVENTS);
        let outcome = apply_discussion_node(&db, &mut batch, &project, &node, state).await?;
        batch.apply(&db).await?;

        assert!(outcome.reached_watermark);
        assert!(
            db.read_with(|tx| DISCUSSION_EVENTS.scan_by_time_tx(tx, oscar_core::DbTime::ZERO))
                .await?
                .is_empty()
        );
        Ok(())
    }
}
