//! The uniform view over authored tracker content, and the outbound-edit
//! contract implemented by each upstream adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::Timestamp;
use crate::error::BoxedError;
use crate::identity::Identity;

/// Any authored content: an issue, a comment, a discussion or a reply.
///
/// `id` and `parent_id` are upstream URLs; `parent_id` is empty for
/// top-level content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    /// Empty for content kinds without titles (comments, replies).
    pub title: String,
    pub body: String,
    pub created: Timestamp,
    pub updated: Timestamp,
    pub author: Option<Identity>,
    pub parent_id: String,
    /// Whether the bot is allowed to edit this post.
    pub can_edit: bool,
    /// Whether children (comments/replies) may be attached.
    pub can_have_children: bool,
}

/// A partial edit to apply to an existing post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostUpdates {
    pub title: Option<String>,
    pub body: Option<String>,
    pub state: Option<String>,
    /// Full replacement set. The tracker replaces labels rather than adding,
    /// so callers must union with the live set first.
    pub labels: Option<Vec<String>>,
}

impl PostUpdates {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none() && self.state.is_none() && self.labels.is_none()
    }
}

#[derive(Debug, Snafu)]
pub enum SourceError {
    #[snafu(display("transport failure: {source}"))]
    Transport { source: BoxedError },
    #[snafu(display("invalid post id `{id}`"))]
    InvalidId { id: String },
    #[snafu(display("post kind at `{id}` does not support this operation"))]
    Unsupported { id: String },
    #[snafu(display("empty update for `{id}`"))]
    EmptyUpdate { id: String },
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Read/Create/Update/Delete against one upstream tracker.
///
/// `delete` is part of the contract surface but no upstream supports it;
/// implementations return [`SourceError::Unsupported`].
#[async_trait]
pub trait Source: Send + Sync {
    /// Download the current upstream state, bypassing any local mirror.
    async fn read(&self, id: &str) -> SourceResult<Post>;

    /// Post new content under `post.parent_id`, returning the new id.
    /// Top-level creation is not supported.
    async fn create(&self, post: &Post) -> SourceResult<String>;

    async fn update(&self, post: &Post, updates: &PostUpdates) -> SourceResult<()>;

    async fn delete(&self, id: &str) -> SourceResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_updates_is_empty() {
        assert!(PostUpdates::default().is_empty());
        assert!(
            !PostUpdates {
                body: Some("text".into()),
                ..Default::default()
            }
            .is_empty()
        );
    }
}
