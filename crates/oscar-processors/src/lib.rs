//! The processors: consumers of the event log, producers of proposed edits.
//!
//! Every processor follows the same shape. It owns a named watcher into the
//! event log and a configuration of explicit options; for each new event it
//! decides whether an edit is warranted, registers it in the action log
//! keyed for dedup, and advances its cursor only when enabled. Disabled
//! ("dry run") processors log what they would do and leave the cursor
//! alone, so enabling them later re-examines the same events.
//!
//! Cursor discipline, shared by all of them:
//!
//! - a skipped event is passed over without marking, and is implicitly
//!   passed when a later event is marked;
//! - transport errors leave the cursor untouched so the next run retries;
//! - content errors (unusable LLM output, bad config references) advance
//!   the cursor; retrying would not help, and one poisoned event must not
//!   stall the queue.

pub mod config;
pub mod labels;
pub mod overview;
pub mod related;
pub mod repro;
pub mod rules;

#[cfg(test)]
pub(crate) mod testutil;

use oscar_ai::AiError;
use oscar_core::Project;
use oscar_db::DbError;
use oscar_github::GithubError;
use snafu::{Location, Snafu};

pub use self::config::ProcessorConfig;

const LOG_TARGET: &str = "oscar::processors";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProcessorError {
    #[snafu(transparent)]
    Db {
        source: DbError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Github {
        source: GithubError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Ai {
        source: AiError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("category `{name}` is not in the configured set"))]
    UnknownCategory { name: String },
}

pub type ProcessorResult<T> = std::result::Result<T, ProcessorError>;

/// The dedup key for one-action-per-issue processors.
pub(crate) fn issue_action_key(project: &Project, number: u64) -> Vec<u8> {
    format!("{project}#{number}").into_bytes()
}
