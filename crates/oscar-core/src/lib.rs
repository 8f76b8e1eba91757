//! Core types shared by every Oscar crate.
//!
//! Oscar mirrors issue-tracker activity into a local ordered store and
//! proposes edits back to the tracker. The types here are the vocabulary the
//! rest of the workspace speaks: store ordering ([`DbTime`]), wall-clock
//! time ([`Timestamp`]), tracker coordinates ([`Project`]), authored content
//! ([`Post`]) and the outbound-edit contract ([`Source`]).

pub mod error;
pub mod identity;
pub mod post;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub use self::identity::{Identity, Realm};
pub use self::post::{Post, PostUpdates, Source, SourceError, SourceResult};

/// Monotonic write counter assigned by the timed log.
///
/// Every write to a timed kind gets a `DbTime` strictly greater than any
/// previously assigned for that kind. Watcher cursors and action ordering
/// are expressed in this unit, never in wall-clock time.
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
pub struct DbTime(pub u64);

impl DbTime {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for DbTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for DbTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Seconds since the Unix epoch.
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
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("Time went backwards")
                .as_secs(),
        )
    }

    pub fn as_secs(self) -> u64 {
        self.0
    }

    /// Saturating difference: zero when `other` is in the future.
    pub fn secs_since(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }

    pub fn from_rfc3339(s: &str) -> Result<Self, time::error::Parse> {
        let dt = time::OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)?;
        Ok(Self(dt.unix_timestamp().max(0) as u64))
    }

    pub fn to_rfc3339(self) -> String {
        i64::try_from(self.0)
            .ok()
            .and_then(|secs| time::OffsetDateTime::from_unix_timestamp(secs).ok())
            .and_then(|dt| {
                dt.format(&time::format_description::well_known::Rfc3339)
                    .ok()
            })
            .unwrap_or_else(|| self.0.to_string())
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("invalid project `{input}`, expected `owner/repo`"))]
pub struct InvalidProjectError {
    pub input: String,
}

/// A tracker project in `"owner/repo"` form.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize,
)]
pub struct Project(String);

impl Project {
    pub fn new(input: impl Into<String>) -> Result<Self, InvalidProjectError> {
        let input = input.into();
        match input.split_once('/') {
            Some((owner, repo))
                if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') =>
            {
                Ok(Self(input))
            }
            _ => Err(InvalidProjectError { input }),
        }
    }

    pub fn owner(&self) -> &str {
        self.0.split_once('/').expect("Validated at construction").0
    }

    pub fn repo(&self) -> &str {
        self.0.split_once('/').expect("Validated at construction").1
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The empty project: the lexicographic minimum, used as the open lower
/// bound of range scans. Never a valid project value.
impl Default for Project {
    fn default() -> Self {
        Self(String::new())
    }
}

impl FromStr for Project {
    type Err = InvalidProjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
