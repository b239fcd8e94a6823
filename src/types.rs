//! Shared primitive identifiers and record-kind enums.

use serde::{Deserialize, Serialize};

/// Decentralized identifier naming an account.
pub type Did = String;
/// Monotonic commit sequence number on the upstream log.
pub type Seq = u64;
/// Unix timestamp in seconds identifying one scoring run.
pub type FeedVersion = i64;

/// Collection name of post records.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";
/// Collection name of like records.
pub const LIKE_COLLECTION: &str = "app.bsky.feed.like";
/// Collection name of follow records.
pub const FOLLOW_COLLECTION: &str = "app.bsky.graph.follow";

/// Record kinds the classifier understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// A post.
    Post,
    /// A like of a post.
    Like,
    /// A follow of an account.
    Follow,
}

impl RecordKind {
    /// Maps a collection NSID onto a known kind.
    pub fn from_collection(collection: &str) -> Option<Self> {
        match collection {
            POST_COLLECTION => Some(Self::Post),
            LIKE_COLLECTION => Some(Self::Like),
            FOLLOW_COLLECTION => Some(Self::Follow),
            _ => None,
        }
    }

    /// Collection NSID for this kind.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Post => POST_COLLECTION,
            Self::Like => LIKE_COLLECTION,
            Self::Follow => FOLLOW_COLLECTION,
        }
    }
}

/// Parsed `at://<authority>/<collection>/<rkey>` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    /// Owning account.
    pub authority: Did,
    /// Collection NSID.
    pub collection: String,
    /// Record key.
    pub rkey: String,
}

impl AtUri {
    /// Builds the URI of a record in `repo` at `path` (`<collection>/<rkey>`).
    pub fn from_repo_path(repo: &str, path: &str) -> Option<Self> {
        let (collection, rkey) = path.split_once('/')?;
        if repo.is_empty() || collection.is_empty() || rkey.is_empty() {
            return None;
        }
        Some(Self {
            authority: repo.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }

    /// Parses a full AT-URI string.
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("at://")?;
        let (authority, path) = rest.split_once('/')?;
        Self::from_repo_path(authority, path)
    }

    /// Account part of an AT-URI, whether or not a record path follows it.
    pub fn authority_of(uri: &str) -> Option<&str> {
        let rest = uri.strip_prefix("at://")?;
        let authority = rest.split_once('/').map_or(rest, |(authority, _)| authority);
        (!authority.is_empty()).then_some(authority)
    }
}

impl std::fmt::Display for AtUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at://{}/{}/{}", self.authority, self.collection, self.rkey)
    }
}
