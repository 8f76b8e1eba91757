//! The outbound adapter: reads live tracker state, applies proposed edits,
//! and diverts mutations to an in-process log when so constructed.

use std::sync::Mutex;

use async_trait::async_trait;
use oscar_core::{DbTime, Identity, Post, PostUpdates, Project, Source, SourceError, SourceResult};
use serde_json::Value;
use snafu::ResultExt as _;
use tracing::info;

use crate::client::Client;
use crate::store::EventWatcher;
use crate::types::{
    Issue, IssueComment, Label, PostId, Typed, comment_url, issue_url, parse_post_id,
};
use crate::{DecodeSnafu, GithubError, GithubResult, LOG_TARGET};

/// A partial edit to an issue. Labels are a full replacement set: the
/// tracker replaces rather than adds, so callers union with the live set.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IssueChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

impl IssueChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none() && self.state.is_none() && self.labels.is_none()
    }
}

/// Issue-level operations the processors run against. The production
/// implementation is [`GithubSource`]; tests substitute their own.
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Download the issue's current upstream state, bypassing the mirror.
    async fn read_issue(&self, project: &Project, number: u64) -> GithubResult<Issue>;

    async fn edit_issue(
        &self,
        project: &Project,
        number: u64,
        changes: &IssueChanges,
    ) -> GithubResult<()>;

    /// Post a new comment; returns its web URL.
    async fn post_comment(&self, project: &Project, number: u64, body: &str)
    -> GithubResult<String>;

    async fn edit_comment(&self, project: &Project, comment_id: u64, body: &str)
    -> GithubResult<()>;

    async fn list_labels(&self, project: &Project) -> GithubResult<Vec<Label>>;

    async fn create_label(&self, project: &Project, label: &Label) -> GithubResult<()>;

    async fn update_label(&self, project: &Project, name: &str, label: &Label)
    -> GithubResult<()>;
}

/// One mutation captured instead of sent upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum DivertedEdit {
    EditIssue {
        project: Project,
        number: u64,
        changes: IssueChanges,
    },
    PostComment {
        project: Project,
        number: u64,
        body: String,
    },
    EditComment {
        project: Project,
        comment_id: u64,
        body: String,
    },
    CreateLabel {
        project: Project,
        label: Label,
    },
    UpdateLabel {
        project: Project,
        name: String,
        label: Label,
    },
}

pub struct GithubSource {
    client: Client,
    /// When present, every mutation lands here instead of upstream.
    divert: Option<Mutex<Vec<DivertedEdit>>>,
}

impl GithubSource {
    pub fn new(client: Client, divert: bool) -> Self {
        Self {
            client,
            divert: divert.then(|| Mutex::new(vec![])),
        }
    }

    pub fn divert_enabled(&self) -> bool {
        self.divert.is_some()
    }

    /// The diverted-edit log, in application order. Empty when not
    /// diverting.
    pub fn diverted_edits(&self) -> Vec<DivertedEdit> {
        match &self.divert {
            Some(edits) => edits.lock().expect("Locking failed").clone(),
            None => vec![],
        }
    }

    /// Record the edit when diverting; true when the caller must not touch
    /// upstream.
    fn diverted(&self, edit: DivertedEdit) -> bool {
        match &self.divert {
            Some(edits) => {
                info!(target: LOG_TARGET, ?edit, "Diverting edit");
                edits.lock().expect("Locking failed").push(edit);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl IssueSource for GithubSource {
    async fn read_issue(&self, project: &Project, number: u64) -> GithubResult<Issue> {
        let url = self.client.api_url(&format!("/repos/{project}/issues/{number}"));
        let value = self.client.get_json(&url).await?;
        serde_json::from_value(value).context(DecodeSnafu)
    }

    async fn edit_issue(
        &self,
        project: &Project,
        number: u64,
        changes: &IssueChanges,
    ) -> GithubResult<()> {
        if self.diverted(DivertedEdit::EditIssue {
            project: project.clone(),
            number,
            changes: changes.clone(),
        }) {
            return Ok(());
        }
        let url = self.client.api_url(&format!("/repos/{project}/issues/{number}"));
        let body = serde_json::to_value(changes).context(DecodeSnafu)?;
        self.client.patch_json(&url, &body).await?;
        Ok(())
    }

    async fn post_comment(
        &self,
        project: &Project,
        number: u64,
        body: &str,
    ) -> GithubResult<String> {
        if let Some(edits) = &self.divert {
            let mut edits = edits.lock().expect("Locking failed");
            let fake_id = edits.len() as u64 + 1;
            info!(target: LOG_TARGET, %project, number, "Diverting comment");
            edits.push(DivertedEdit::PostComment {
                project: project.clone(),
                number,
                body: body.to_string(),
            });
            return Ok(comment_url(project, number, fake_id));
        }
        let url = self
            .client
            .api_url(&format!("/repos/{project}/issues/{number}/comments"));
        let response = self
            .client
            .post_json(&url, &serde_json::json!({ "body": body }))
            .await?;
        Ok(response
            .get("html_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| issue_url(project, number)))
    }

    async fn edit_comment(
        &self,
        project: &Project,
        comment_id: u64,
        body: &str,
    ) -> GithubResult<()> {
        if self.diverted(DivertedEdit::EditComment {
            project: project.clone(),
            comment_id,
            body: body.to_string(),
        }) {
            return Ok(());
        }
        let url = self
            .client
            .api_url(&format!("/repos/{project}/issues/comments/{comment_id}"));
        self.client
            .patch_json(&url, &serde_json::json!({ "body": body }))
            .await?;
        Ok(())
    }

    async fn list_labels(&self, project: &Project) -> GithubResult<Vec<Label>> {
        let url = self
            .client
            .api_url(&format!("/repos/{project}/labels?per_page=100"));
        let value = self.client.get_json(&url).await?;
        serde_json::from_value(value).context(DecodeSnafu)
    }

    async fn create_label(&self, project: &Project, label: &Label) -> GithubResult<()> {
        if self.diverted(DivertedEdit::CreateLabel {
            project: project.clone(),
            label: label.clone(),
        }) {
            return Ok(());
        }
        let url = self.client.api_url(&format!("/repos/{project}/labels"));
        self.client
            .post_json(&url, &serde_json::to_value(label).context(DecodeSnafu)?)
            .await?;
        Ok(())
    }

    async fn update_label(
        &self,
        project: &Project,
        name: &str,
        label: &Label,
    ) -> GithubResult<()> {
        if self.diverted(DivertedEdit::UpdateLabel {
            project: project.clone(),
            name: name.to_string(),
            label: label.clone(),
        }) {
            return Ok(());
        }
        let url = self.client.api_url(&format!("/repos/{project}/labels/{name}"));
        self.client
            .patch_json(&url, &serde_json::to_value(label).context(DecodeSnafu)?)
            .await?;
        Ok(())
    }
}

pub fn issue_to_post(project: &Project, issue: &Issue) -> Post {
    let id = if issue.html_url.is_empty() {
        issue_url(project, issue.number)
    } else {
        issue.html_url.clone()
    };
    Post {
        id,
        title: issue.title.clone(),
        body: issue.body().to_string(),
        created: issue.created_time(),
        updated: issue.updated_time(),
        author: Some(Identity::github(&issue.user.login)),
        parent_id: String::new(),
        can_edit: true,
        can_have_children: true,
    }
}

pub fn comment_to_post(project: &Project, comment: &IssueComment) -> Post {
    let number = comment.issue_number().unwrap_or(0);
    let id = if comment.html_url.is_empty() {
        comment_url(project, number, comment.id)
    } else {
        comment.html_url.clone()
    };
    Post {
        id,
        title: String::new(),
        body: comment.body().to_string(),
        created: crate::types::parse_time_or_zero(&comment.created_at),
        updated: comment.updated_time(),
        author: Some(Identity::github(&comment.user.login)),
        parent_id: issue_url(project, number),
        can_edit: true,
        can_have_children: false,
    }
}

fn transport(err: GithubError) -> SourceError {
    SourceError::Transport {
        source: Box::new(err),
    }
}

#[async_trait]
impl Source for GithubSource {
    async fn read(&self, id: &str) -> SourceResult<Post> {
        match parse_post_id(id) {
            Some(PostId::Issue { project, number }) => {
                let issue = self
                    .read_issue(&project, number)
                    .await
                    .map_err(transport)?;
                Ok(issue_to_post(&project, &issue))
            }
            Some(PostId::Comment {
                project,
                comment_id,
                ..
            }) => {
                let url = self
                    .client
                    .api_url(&format!("/repos/{project}/issues/comments/{comment_id}"));
                let value = self.client.get_json(&url).await.map_err(transport)?;
                let comment: IssueComment = serde_json::from_value(value)
                    .context(DecodeSnafu)
                    .map_err(transport)?;
                Ok(comment_to_post(&project, &comment))
            }
            None => Err(SourceError::InvalidId { id: id.to_string() }),
        }
    }

    async fn create(&self, post: &Post) -> SourceResult<String> {
        let Some(PostId::Issue { project, number }) = parse_post_id(&post.parent_id) else {
            return Err(SourceError::InvalidId {
                id: post.parent_id.clone(),
            });
        };
        self.post_comment(&project, number, &post.body)
            .await
            .map_err(transport)
    }

    async fn update(&self, post: &Post, updates: &PostUpdates) -> SourceResult<()> {
        if updates.is_empty() {
            return Err(SourceError::EmptyUpdate {
                id: post.id.clone(),
            });
        }
        match parse_post_id(&post.id) {
            Some(PostId::Issue { project, number }) => {
                let changes = IssueChanges {
                    title: updates.title.clone(),
                    body: updates.body.clone(),
                    state: updates.state.clone(),
                    labels: updates.labels.clone(),
                };
                self.edit_issue(&project, number, &changes)
                    .await
                    .map_err(transport)
            }
            Some(PostId::Comment {
                project,
                comment_id,
                ..
            }) => {
                // Comments only carry a body.
                if updates.title.is_some() || updates.state.is_some() || updates.labels.is_some() {
                    return Err(SourceError::Unsupported {
                        id: post.id.clone(),
                    });
                }
                let Some(body) = &updates.body else {
                    return Err(SourceError::EmptyUpdate {
                        id: post.id.clone(),
                    });
                };
                self.edit_comment(&project, comment_id, body)
                    .await
                    .map_err(transport)
            }
            None => Err(SourceError::InvalidId {
                id: post.id.clone(),
            }),
        }
    }

    async fn delete(&self, id: &str) -> SourceResult<()> {
        Err(SourceError::Unsupported { id: id.to_string() })
    }
}

/// The adapter's watcher surface: non-PR issues and issue comments as
/// uniform [`Post`]s.
pub struct PostWatcher {
    inner: EventWatcher,
}

impl PostWatcher {
    pub async fn new(db: &oscar_db::Database, name: impl Into<String>) -> oscar_db::DbResult<Self> {
        Ok(Self {
            inner: EventWatcher::github(db, name).await?,
        })
    }

    pub async fn recent(&self, db: &oscar_db::Database) -> oscar_db::DbResult<Vec<(DbTime, Post)>> {
        let events = self.inner.recent(db).await?;
        Ok(events
            .into_iter()
            .filter_map(|event| match &event.typed {
                Typed::Issue(issue) if !issue.is_pull_request() => {
                    Some((event.db_time, issue_to_post(&event.project, issue)))
                }
                Typed::IssueComment(comment) => {
                    Some((event.db_time, comment_to_post(&event.project, comment)))
                }
                Typed::Issue(_)
                | Typed::IssueEvent(_)
                | Typed::Discussion(_)
                | Typed::DiscussionComment(_) => None,
            })
            .collect())
    }

    pub fn mark_old(&mut self, t: DbTime) {
        self.inner.mark_old(t);
    }

    pub async fn flush(&self, db: &oscar_db::Database) -> oscar_db::DbResult<()> {
        self.inner.flush(db).await
    }
}

#[cfg(test)]
mod tests {
    use oscar_core::error::BoxedErrorResult;
    use oscar_db::Database;

    use super::*;
    use crate::store::{self, GITHUB_EVENTS};
    use crate::types::ApiKind;

    fn diverting_source() -> GithubSource {
        GithubSource::new(Client::new(None), true)
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn diverted_mutations_never_reach_upstream() -> BoxedErrorResult<()> {
        let source = diverting_source();
        let project = Project::new("golang/go")?;

        let comment_id = source.post_comment(&project, 7, "hello").await?;
        assert_eq!(comment_id, comment_url(&project, 7, 1));

        source
            .edit_issue(
                &project,
                7,
                &IssueChanges {
                    labels: Some(vec!["NeedsFix".into()]),
                    ..Default::default()
                },
            )
            .await?;

        let edits = source.diverted_edits();
        assert_eq!(edits.len(), 2);
        assert_eq!(
            edits[0],
            DivertedEdit::PostComment {
                project: project.clone(),
                number: 7,
                body: "hello".into(),
            }
        );
        assert!(matches!(edits[1], DivertedEdit::EditIssue { .. }));
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn source_update_routes_by_post_id() -> BoxedErrorResult<()> {
        let source = diverting_source();
        let project = Project::new("golang/go")?;

        let issue_post = Post {
            id: issue_url(&project, 3),
            ..Default::default()
        };
        source
            .update(
                &issue_post,
                &PostUpdates {
                    labels: Some(vec!["Bug".into()]),
                    ..Default::default()
                },
            )
            .await?;

        let comment_post = Post {
            id: comment_url(&project, 3, 55),
            ..Default::default()
        };
        source
            .update(
                &comment_post,
                &PostUpdates {
                    body: Some("edited".into()),
                    ..Default::default()
                },
            )
            .await?;

        // Label edits on comments are not a thing.
        let err = source
            .update(
                &comment_post,
                &PostUpdates {
                    labels: Some(vec!["Bug".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unsupported { .. }));

        // Empty updates are rejected before any transport happens.
        let err = source
            .update(&issue_post, &PostUpdates::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::EmptyUpdate { .. }));

        let edits = source.diverted_edits();
        assert_eq!(edits.len(), 2);
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn delete_is_unsupported_by_contract() -> BoxedErrorResult<()> {
        let source = diverting_source();
        let err = source
            .delete("https://github.com/golang/go/issues/1")
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unsupported { .. }));
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn post_watcher_yields_issues_and_comments_not_prs() -> BoxedErrorResult<()> {
        let db = Database::new_in_memory().await?;
        store::init_tables(&db).await?;
        let project = Project::new("golang/go")?;

        let issue = serde_json::json!({
            "number": 1,
            "title": "real issue",
            "body": "text",
            "state": "open",
            "user": {"login": "gopher"},
            "html_url": issue_url(&project, 1),
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
        });
        let pull = serde_json::json!({
            "number": 2,
            "title": "a PR",
            "state": "open",
            "user": {"login": "gopher"},
            "pull_request": {},
            "updated_at": "2024-01-01T00:00:00Z",
        });
        let comment = serde_json::json!({
            "id": 10,
            "body": "comment",
            "user": {"login": "reviewer"},
            "html_url": comment_url(&project, 1, 10),
            "issue_url": "https://api.github.com/repos/golang/go/issues/1",
            "created_at": "2024-01-01T01:00:00Z",
            "updated_at": "2024-01-01T01:00:00Z",
        });

        for (key, json) in [
            ((project.clone(), 1, ApiKind::Issues, 1u64), &issue),
            ((project.clone(), 2, ApiKind::Issues, 2), &pull),
            ((project.clone(), 1, ApiKind::IssueComments, 10), &comment),
        ] {
            GITHUB_EVENTS.set(&db, key, serde_json::to_vec(json)?).await?;
        }

        let watcher = PostWatcher::new(&db, "posts").await?;
        let posts = watcher.recent(&db).await?;
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].1.id, issue_url(&project, 1));
        assert!(posts[0].1.can_have_children);
        assert_eq!(posts[1].1.parent_id, issue_url(&project, 1));
        assert!(!posts[1].1.can_have_children);
        Ok(())
    }
}
