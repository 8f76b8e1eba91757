//! GitHub upstream: event model, local event mirror, ingestors, the
//! outbound source adapter and the webhook validator.
//!
//! Everything the rest of Oscar knows about GitHub flows through this crate.
//! Ingestors write events into the timed log; processors read them back
//! through named watchers; the source adapter carries proposed edits
//! upstream (or into the divert log under test).

pub mod client;
pub mod discussions;
pub mod ingest;
pub mod source;
pub mod store;
pub mod types;
pub mod webhook;

use oscar_db::DbError;
use snafu::{Location, Snafu};

pub use self::client::Client;
pub use self::discussions::DiscussionsIngestor;
pub use self::ingest::IssuesIngestor;
pub use self::source::{
    DivertedEdit, GithubSource, IssueChanges, IssueSource, PostWatcher, comment_to_post,
    issue_to_post,
};
pub use self::store::{DISCUSSION_EVENTS, EventWatcher, GITHUB_EVENTS, events, events_after};
pub use self::types::{
    ApiKind, Discussion, DiscussionComment, Event, EventKey, Issue, IssueComment, IssueEvent,
    Label, Typed, User, comment_url, issue_url,
};
pub use self::webhook::{Secrets, WebhookError, WebhookEvent, WebhookRequest};
pub use self::webhook::validate as validate_webhook;

const LOG_TARGET: &str = "oscar::github";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GithubError {
    #[snafu(display("HTTP request failed: {source}"))]
    Http {
        source: reqwest::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("unexpected status {status} from {url}"))]
    Status { status: u16, url: String },
    #[snafu(display("rate limited by {url} after {attempts} attempts"))]
    RateLimited { url: String, attempts: u32 },
    #[snafu(display("failed to decode upstream JSON: {source}"))]
    Decode {
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("missing `{field}` in upstream response"))]
    MissingField { field: &'static str },
    #[snafu(transparent)]
    Db {
        source: DbError,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type GithubResult<T> = std::result::Result<T, GithubError>;
