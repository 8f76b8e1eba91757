//! Shared test fixtures: an in-memory issue source whose mutations land in
//! an edit log, and helpers that seed the event mirror.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use oscar_core::Project;
use oscar_core::error::BoxedErrorResult;
use oscar_db::Database;
use oscar_github::store::GITHUB_EVENTS;
use oscar_github::{
    ApiKind, DivertedEdit, GithubResult, Issue, IssueChanges, IssueSource, Label, StatusSnafu,
    comment_url, issue_url,
};

#[derive(Default)]
pub struct TestGithub {
    issues: Mutex<HashMap<(Project, u64), Issue>>,
    labels: Mutex<HashMap<Project, Vec<Label>>>,
    edits: Mutex<Vec<DivertedEdit>>,
}

impl TestGithub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_issue(&self, project: &Project, issue: Issue) {
        self.issues
            .lock()
            .expect("Locking failed")
            .insert((project.clone(), issue.number), issue);
    }

    pub fn put_labels(&self, project: &Project, labels: Vec<Label>) {
        self.labels
            .lock()
            .expect("Locking failed")
            .insert(project.clone(), labels);
    }

    pub fn edits(&self) -> Vec<DivertedEdit> {
        self.edits.lock().expect("Locking failed").clone()
    }

    fn record(&self, edit: DivertedEdit) {
        self.edits.lock().expect("Locking failed").push(edit);
    }
}

#[async_trait]
impl IssueSource for TestGithub {
    async fn read_issue(&self, project: &Project, number: u64) -> GithubResult<Issue> {
        self.issues
            .lock()
            .expect("Locking failed")
            .get(&(project.clone(), number))
            .cloned()
            .ok_or_else(|| {
                StatusSnafu {
                    status: 404u16,
                    url: issue_url(project, number),
                }
                .build()
            })
    }

    async fn edit_issue(
        &self,
        project: &Project,
        number: u64,
        changes: &IssueChanges,
    ) -> GithubResult<()> {
        self.record(DivertedEdit::EditIssue {
            project: project.clone(),
            number,
            changes: changes.clone(),
        });
        Ok(())
    }

    async fn post_comment(
        &self,
        project: &Project,
        number: u64,
        body: &str,
    ) -> GithubResult<String> {
        let fake_id = {
            let mut edits = self.edits.lock().expect("Locking failed");
            edits.push(DivertedEdit::PostComment {
                project: project.clone(),
                number,
                body: body.to_string(),
            });
            edits.len() as u64
        };
        Ok(comment_url(project, number, fake_id))
    }

    async fn edit_comment(
        &self,
        project: &Project,
        comment_id: u64,
        body: &str,
    ) -> GithubResult<()> {
        self.record(DivertedEdit::EditComment {
            project: project.clone(),
            comment_id,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn list_labels(&self, project: &Project) -> GithubResult<Vec<Label>> {
        Ok(self
            .labels
            .lock()
            .expect("Locking failed")
            .get(project)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_label(&self, project: &Project, label: &Label) -> GithubResult<()> {
        self.record(DivertedEdit::CreateLabel {
            project: project.clone(),
            label: label.clone(),
        });
        Ok(())
    }

    async fn update_label(
        &self,
        project: &Project,
        name: &str,
        label: &Label,
    ) -> GithubResult<()> {
        self.record(DivertedEdit::UpdateLabel {
            project: project.clone(),
            name: name.to_string(),
            label: label.clone(),
        });
        Ok(())
    }
}

pub fn test_issue(project: &Project, number: u64, title: &str, body: &str) -> Issue {
    Issue {
        number,
        title: title.into(),
        body: Some(body.into()),
        state: "open".into(),
        user: oscar_github::User {
            login: "reporter".into(),
        },
        html_url: issue_url(project, number),
        created_at: "2024-01-01T00:00:00Z".into(),
        updated_at: "2024-01-01T00:00:00Z".into(),
        ..Default::default()
    }
}

/// Write an issue into the event mirror the way the ingestor would.
pub async fn seed_issue(db: &Database, project: &Project, issue: &Issue) -> BoxedErrorResult<()> {
    GITHUB_EVENTS
        .set(
            db,
            (project.clone(), issue.number, ApiKind::Issues, issue.number),
            serde_json::to_vec(&issue)?,
        )
        .await?;
    Ok(())
}

/// Write an issue comment into the event mirror.
pub async fn seed_comment(
    db: &Database,
    project: &Project,
    issue: u64,
    comment_id: u64,
    author: &str,
    body: &str,
) -> BoxedErrorResult<()> {
    let json = serde_json::json!({
        "id": comment_id,
        "body": body,
        "user": {"login": author},
        "html_url": comment_url(project, issue, comment_id),
        "issue_url": format!("https://api.github.com/repos/{project}/issues/{issue}"),
        "created_at": "2024-01-01T01:00:00Z",
        "updated_at": "2024-01-01T01:00:00Z",
    });
    GITHUB_EVENTS
        .set(
            db,
            (project.clone(), issue, ApiKind::IssueComments, comment_id),
            serde_json::to_vec(&json)?,
        )
        .await?;
    Ok(())
}

pub async fn temp_db() -> BoxedErrorResult<Database> {
    let db = Database::new_in_memory().await?;
    oscar_github::store::init_tables(&db).await?;
    Ok(db)
}
