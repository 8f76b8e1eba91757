//! Author identities attached to posts.

use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Where an identity lives. A small closed set: matching on it must stay
/// exhaustive so new realms are handled everywhere they matter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize,
)]
pub enum Realm {
    GithubUser,
    GerritUser,
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct Identity {
    pub realm: Realm,
    pub id: String,
    pub display_name: String,
}

impl Identity {
    pub fn github(login: impl Into<String>) -> Self {
        let login = login.into();
        Self {
            realm: Realm::GithubUser,
            display_name: login.clone(),
            id: login,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.realm {
            Realm::GithubUser => write!(f, "@{}", self.id),
            Realm::GerritUser => write!(f, "gerrit:{}", self.id),
            Realm::Email => f.write_str(&self.id),
        }
    }
}
