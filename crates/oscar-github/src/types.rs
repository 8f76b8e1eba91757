//! The typed GitHub event model.
//!
//! Events are stored as the raw upstream JSON; [`Typed`] is the decoded
//! view, a tagged variant matched exhaustively wherever events are
//! consumed. Field sets are the subset Oscar acts on; unknown upstream
//! fields survive untouched in the raw JSON.

use std::fmt;

use bincode::{Decode, Encode};
use oscar_core::{DbTime, Project, Timestamp};
use serde::{Deserialize, Serialize};

/// Upstream API surface an event came from. The serialized order of the
/// variants is part of the store key encoding: append only.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub enum ApiKind {
    #[default]
    Issues,
    IssueComments,
    IssueEvents,
    Discussions,
    DiscussionComments,
}

impl ApiKind {
    pub const MIN: Self = Self::Issues;
    pub const MAX: Self = Self::DiscussionComments;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issues => "/issues",
            Self::IssueComments => "/issues/comments",
            Self::IssueEvents => "/issues/events",
            Self::Discussions => "/discussions",
            Self::DiscussionComments => "/discussions/comments",
        }
    }
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(project, parent number, api, id)`: unique per event, and the sort
/// order of the primary event table.
pub type EventKey = (Project, u64, ApiKind, u64);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Label {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub user: User,
    pub labels: Vec<Label>,
    /// Present iff the "issue" is really a pull request.
    pub pull_request: Option<serde_json::Value>,
    pub html_url: String,
    pub comments: u64,
    pub created_at: String,
    pub updated_at: String,
}

impl Issue {
    pub fn body(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }

    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.state == "open"
    }

    pub fn updated_time(&self) -> Timestamp {
        parse_time_or_zero(&self.updated_at)
    }

    pub fn created_time(&self) -> Timestamp {
        parse_time_or_zero(&self.created_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueComment {
    pub id: u64,
    pub body: Option<String>,
    pub user: User,
    pub html_url: String,
    /// REST API URL of the parent issue; the trailing segment is the issue
    /// number.
    pub issue_url: String,
    pub created_at: String,
    pub updated_at: String,
}

impl IssueComment {
    pub fn body(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }

    pub fn updated_time(&self) -> Timestamp {
        parse_time_or_zero(&self.updated_at)
    }

    pub fn issue_number(&self) -> Option<u64> {
        self.issue_url.rsplit('/').next()?.parse().ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueEvent {
    pub id: u64,
    pub event: String,
    pub actor: User,
    pub issue: Issue,
    pub created_at: String,
}

impl IssueEvent {
    pub fn created_time(&self) -> Timestamp {
        parse_time_or_zero(&self.created_at)
    }
}

/// Discussions arrive over GraphQL; aliases accept both the GraphQL field
/// names and the snake_case names this crate writes back out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Discussion {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    #[serde(alias = "author")]
    pub user: User,
    #[serde(alias = "url")]
    pub html_url: String,
    #[serde(alias = "createdAt")]
    pub created_at: String,
    #[serde(alias = "updatedAt")]
    pub updated_at: String,
}

impl Discussion {
    pub fn body(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }

    pub fn updated_time(&self) -> Timestamp {
        parse_time_or_zero(&self.updated_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscussionComment {
    #[serde(alias = "databaseId")]
    pub id: u64,
    pub body: Option<String>,
    #[serde(alias = "author")]
    pub user: User,
    #[serde(alias = "url")]
    pub html_url: String,
    #[serde(alias = "createdAt")]
    pub created_at: String,
    #[serde(alias = "updatedAt")]
    pub updated_at: String,
}

impl DiscussionComment {
    pub fn body(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }

    pub fn updated_time(&self) -> Timestamp {
        parse_time_or_zero(&self.updated_at)
    }
}

/// Decoded view of an event's JSON, tagged by [`ApiKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Typed {
    Issue(Issue),
    IssueComment(IssueComment),
    IssueEvent(IssueEvent),
    Discussion(Discussion),
    DiscussionComment(DiscussionComment),
}

impl Typed {
    pub fn decode(api: ApiKind, json: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match api {
            ApiKind::Issues => Self::Issue(serde_json::from_value(json.clone())?),
            ApiKind::IssueComments => Self::IssueComment(serde_json::from_value(json.clone())?),
            ApiKind::IssueEvents => Self::IssueEvent(serde_json::from_value(json.clone())?),
            ApiKind::Discussions => Self::Discussion(serde_json::from_value(json.clone())?),
            ApiKind::DiscussionComments => {
                Self::DiscussionComment(serde_json::from_value(json.clone())?)
            }
        })
    }

    pub fn updated_time(&self) -> Timestamp {
        match self {
            Self::Issue(issue) => issue.updated_time(),
            Self::IssueComment(comment) => comment.updated_time(),
            Self::IssueEvent(event) => event.created_time(),
            Self::Discussion(discussion) => discussion.updated_time(),
            Self::DiscussionComment(comment) => comment.updated_time(),
        }
    }
}

/// One observed unit of tracker activity, as delivered to processors.
#[derive(Debug, Clone)]
pub struct Event {
    pub project: Project,
    /// Parent entity number: issue or discussion.
    pub issue: u64,
    pub api: ApiKind,
    pub id: u64,
    pub db_time: DbTime,
    pub json: serde_json::Value,
    pub typed: Typed,
}

impl Event {
    pub fn key(&self) -> EventKey {
        (self.project.clone(), self.issue, self.api, self.id)
    }

    pub fn updated(&self) -> Timestamp {
        self.typed.updated_time()
    }
}

pub(crate) fn parse_time_or_zero(input: &str) -> Timestamp {
    Timestamp::from_rfc3339(input).unwrap_or(Timestamp::ZERO)
}

/// Canonical web URL of an issue.
pub fn issue_url(project: &Project, number: u64) -> String {
    format!("https://github.com/{project}/issues/{number}")
}

/// Canonical web URL of an issue comment.
pub fn comment_url(project: &Project, number: u64, comment_id: u64) -> String {
    format!("https://github.com/{project}/issues/{number}#issuecomment-{comment_id}")
}

/// A parsed post id URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostId {
    Issue {
        project: Project,
        number: u64,
    },
    Comment {
        project: Project,
        number: u64,
        comment_id: u64,
    },
}

pub fn parse_post_id(id: &str) -> Option<PostId> {
    let rest = id.strip_prefix("https://github.com/")?;
    let (owner, rest) = rest.split_once('/')?;
    let (repo, rest) = rest.split_once("/issues/")?;
    let project = Project::new(format!("{owner}/{repo}")).ok()?;
    match rest.split_once("#issuecomment-") {
        Some((number, comment_id)) => Some(PostId::Comment {
            project,
            number: number.parse().ok()?,
            comment_id: comment_id.parse().ok()?,
        }),
        None => Some(PostId::Issue {
            project,
            number: rest.parse().ok()?,
        }),
    }
}
